use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::backend::{GeometryBackend, IndexBufferHandle};
use super::error::Result;
use super::geometry::{grid_indices, HoleRect};

/// Structural description of a ring index buffer. Two rings with equal keys
/// share the same buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub w: u32,
    pub h: u32,
    pub border_x: u32,
    pub border_y: u32,
    pub hole_w: u32,
    pub hole_h: u32,
    pub stitched: bool,
}

impl IndexKey {
    /// Key for a grid without a hole.
    pub fn full(w: u32, h: u32, stitched: bool) -> Self {
        Self {
            w,
            h,
            border_x: 0,
            border_y: 0,
            hole_w: 0,
            hole_h: 0,
            stitched,
        }
    }

    pub fn hole(&self) -> HoleRect {
        HoleRect {
            x: self.border_x,
            y: self.border_y,
            w: self.hole_w,
            h: self.hole_h,
        }
    }

    pub fn generate(&self) -> Vec<u32> {
        grid_indices(self.w, self.h, self.hole(), self.stitched)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct IndexBuffer {
    pub handle: IndexBufferHandle,
    pub count: u32,
}

/// Append-only cache of ring index buffers.
#[derive(Default)]
pub struct TileCache {
    entries: HashMap<IndexKey, Arc<IndexBuffer>>,
}

impl TileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        key: IndexKey,
        backend: &mut impl GeometryBackend,
    ) -> Result<Arc<IndexBuffer>> {
        if let Some(buffer) = self.entries.get(&key) {
            return Ok(buffer.clone());
        }

        let indices = key.generate();
        let handle = backend.create_index_buffer(&indices)?;
        debug!("populate terrain IB cache: {:?} ({} indices)", key, indices.len());

        let buffer = Arc::new(IndexBuffer {
            handle,
            count: indices.len() as u32,
        });
        self.entries.insert(key, buffer.clone());
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::backend::{BufferUsage, TerrainVertex, VertexBufferHandle};

    #[derive(Default)]
    struct CountingBackend {
        index_buffers: u32,
    }

    impl GeometryBackend for CountingBackend {
        fn create_vertex_buffer(
            &mut self,
            _: &[TerrainVertex],
            _: BufferUsage,
        ) -> Result<VertexBufferHandle> {
            Ok(VertexBufferHandle(0))
        }

        fn update_vertex_buffer(
            &mut self,
            _: VertexBufferHandle,
            _: &[TerrainVertex],
        ) -> Result<()> {
            Ok(())
        }

        fn release_vertex_buffer(&mut self, _: VertexBufferHandle) {}

        fn create_index_buffer(&mut self, _: &[u32]) -> Result<IndexBufferHandle> {
            self.index_buffers += 1;
            Ok(IndexBufferHandle(self.index_buffers))
        }
    }

    #[test]
    fn equal_keys_share_one_buffer() {
        let mut backend = CountingBackend::default();
        let mut cache = TileCache::new();
        let key = IndexKey {
            w: 32,
            h: 32,
            border_x: 8,
            border_y: 8,
            hole_w: 16,
            hole_h: 16,
            stitched: true,
        };

        let a = cache.get_or_create(key, &mut backend).unwrap();
        let b = cache.get_or_create(key, &mut backend).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.index_buffers, 1);
        assert_eq!(cache.len(), 1);

        let c = cache
            .get_or_create(IndexKey { stitched: false, ..key }, &mut backend)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn count_matches_generated_indices() {
        let mut backend = CountingBackend::default();
        let mut cache = TileCache::new();
        let key = IndexKey::full(8, 8, false);
        let buffer = cache.get_or_create(key, &mut backend).unwrap();
        assert_eq!(buffer.count, 8 * 8 * 6);
    }
}
