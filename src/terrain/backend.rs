use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::error::Result;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct VertexBufferHandle(pub u32);

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct IndexBufferHandle(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferUsage {
    Static,
    Dynamic,
}

/// Interleaved terrain vertex as uploaded to the GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub bitangent: [f32; 3],
    pub uv: [f32; 2],
}

pub fn vertex_bytes(vertices: &[TerrainVertex]) -> &[u8] {
    bytemuck::cast_slice(vertices)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// GPU buffer factory the terrain builds its meshes through.
pub trait GeometryBackend {
    fn create_vertex_buffer(
        &mut self,
        vertices: &[TerrainVertex],
        usage: BufferUsage,
    ) -> Result<VertexBufferHandle>;

    /// Overwrites an existing buffer with new contents of the same layout.
    fn update_vertex_buffer(
        &mut self,
        buffer: VertexBufferHandle,
        vertices: &[TerrainVertex],
    ) -> Result<()>;

    fn release_vertex_buffer(&mut self, buffer: VertexBufferHandle);

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        let vertices = [TerrainVertex::default(); 3];
        assert_eq!(std::mem::size_of::<TerrainVertex>(), 14 * 4);
        assert_eq!(vertex_bytes(&vertices).len(), 3 * 14 * 4);
    }

    #[test]
    fn bounds_from_points() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());
        let aabb =
            Aabb::from_points([Vec3::new(1.0, -2.0, 3.0), Vec3::new(-1.0, 4.0, 0.0)]).unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 4.0, 3.0));
        assert!(aabb.contains(Vec3::ZERO));
        assert!(!aabb.contains(Vec3::new(0.0, 5.0, 0.0)));
    }
}
