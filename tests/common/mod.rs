#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;

use glam::Vec3;
use image::{GrayImage, Luma};
use medea_terrain::{
    BufferUsage, CameraId, Error, FetchRequest, FetchResult, FetchSender, GeometryBackend,
    HeightImage, HeightmapSource, IndexBufferHandle, Result, TerrainCamera, TerrainVertex,
    VertexBufferHandle,
};

/// Records every buffer operation instead of talking to a GPU.
#[derive(Default)]
pub struct MockBackend {
    next_handle: u32,
    pub vertex_buffers: HashMap<VertexBufferHandle, Vec<TerrainVertex>>,
    pub usages: HashMap<VertexBufferHandle, BufferUsage>,
    pub created: usize,
    pub updated: usize,
    pub released: Vec<VertexBufferHandle>,
    pub index_buffers: Vec<Vec<u32>>,
}

impl GeometryBackend for MockBackend {
    fn create_vertex_buffer(
        &mut self,
        vertices: &[TerrainVertex],
        usage: BufferUsage,
    ) -> Result<VertexBufferHandle> {
        self.next_handle += 1;
        let handle = VertexBufferHandle(self.next_handle);
        self.vertex_buffers.insert(handle, vertices.to_vec());
        self.usages.insert(handle, usage);
        self.created += 1;
        Ok(handle)
    }

    fn update_vertex_buffer(
        &mut self,
        buffer: VertexBufferHandle,
        vertices: &[TerrainVertex],
    ) -> Result<()> {
        let slot = self
            .vertex_buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::Backend(format!("unknown vertex buffer {buffer:?}")))?;
        *slot = vertices.to_vec();
        self.updated += 1;
        Ok(())
    }

    fn release_vertex_buffer(&mut self, buffer: VertexBufferHandle) {
        self.vertex_buffers.remove(&buffer);
        self.released.push(buffer);
    }

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle> {
        self.index_buffers.push(indices.to_vec());
        Ok(IndexBufferHandle(self.index_buffers.len() as u32))
    }
}

pub fn flat_image(w: u32, h: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(w, h, Luma([value]))
}

/// Serves every fetch at once with a flat heightmap of the requested extent.
pub struct FlatSource {
    pub value: u8,
    pub requests: Vec<FetchRequest>,
}

impl FlatSource {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            requests: Vec::new(),
        }
    }
}

impl HeightmapSource for FlatSource {
    fn fetch(&mut self, request: FetchRequest, done: FetchSender) {
        let [w, h] = request.extent;
        let image = HeightImage::new(flat_image(w, h, self.value), request.extent);
        let _ = done.send(FetchResult {
            map: request.map,
            image: Ok(image),
        });
        self.requests.push(request);
    }
}

/// Holds fetches until the test resolves them.
#[derive(Default)]
pub struct ManualSource {
    pub pending: Vec<(FetchRequest, FetchSender)>,
    pub issued: Vec<FetchRequest>,
}

impl ManualSource {
    pub fn complete_with(&mut self, index: usize, pixels: GrayImage) {
        let (request, done) = self.pending.remove(index);
        let image = HeightImage::new(pixels, request.extent);
        let _ = done.send(FetchResult {
            map: request.map,
            image: Ok(image),
        });
    }

    pub fn complete_all(&mut self, value: u8) {
        while !self.pending.is_empty() {
            let [w, h] = self.pending[0].0.extent;
            self.complete_with(0, flat_image(w, h, value));
        }
    }

    pub fn fail_all(&mut self) {
        for (request, done) in self.pending.drain(..) {
            let _ = done.send(FetchResult {
                map: request.map,
                image: Err(Error::loading(request.url.clone(), "connection refused")),
            });
        }
    }
}

impl HeightmapSource for ManualSource {
    fn fetch(&mut self, request: FetchRequest, done: FetchSender) {
        self.issued.push(request.clone());
        self.pending.push((request, done));
    }
}

pub struct TestCamera {
    id: CameraId,
    name: String,
    pub position: Cell<Vec3>,
    pub viewport: Cell<bool>,
}

impl TestCamera {
    pub fn new(id: u64, position: Vec3) -> Self {
        Self {
            id: CameraId(id),
            name: format!("camera-{id}"),
            position: Cell::new(position),
            viewport: Cell::new(true),
        }
    }
}

impl TerrainCamera for TestCamera {
    fn id(&self) -> CameraId {
        self.id
    }

    fn world_position(&self) -> Vec3 {
        self.position.get()
    }

    fn has_viewport(&self) -> bool {
        self.viewport.get()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Description of a square terrain with one map per LOD.
pub fn pyramid_description(size: u32, unitbase: u32, scale: [f32; 3]) -> String {
    let mut maps = Vec::new();
    let mut s = size;
    let mut lod = 0;
    while s > 0 {
        maps.push(format!(r#"{{"size": [{s}, {s}], "img": "hm{lod}.png"}}"#));
        s /= 2;
        lod += 1;
    }
    format!(
        r#"{{
            "size": [{size}, {size}],
            "unitbase": {unitbase},
            "scale": [{}, {}, {}],
            "maps": [{}],
            "materials": [
                {{"effect": "terrain", "constants": {{"diffuse": "./grass.png"}}}},
                {{"clonefrom": 0}}
            ]
        }}"#,
        scale[0],
        scale[1],
        scale[2],
        maps.join(", ")
    )
}
