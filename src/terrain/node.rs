use glam::{Vec2, Vec3, Vec4};
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

use super::backend::{Aabb, BufferUsage, GeometryBackend, VertexBufferHandle};
use super::config::TerrainSettings;
use super::error::Result;
use super::geometry::{assemble_vertices, heightfield_uvs, vertex_fetch_quad};
use super::images::HeightmapSource;
use super::index_cache::TileCache;
use super::json::{load_description, TerrainDescription};
use super::material::{Material, MaterialFlags};
use super::ring::{RingSet, RingTicket, TerrainMesh, TerrainRing};
use super::sampler::{HeightSampler, LodRequest, LodResolution, TileDescriptor};
use super::worker::{Dispatched, Job, JobOutput, WorkerDispatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub u64);

/// What the terrain needs to know about a camera looking at it.
pub trait TerrainCamera {
    fn id(&self) -> CameraId;
    fn world_position(&self) -> Vec3;
    /// Cameras without a viewport no longer render and lose their rings.
    fn has_viewport(&self) -> bool;
    fn name(&self) -> &str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Partial,
    Full,
}

#[derive(Debug)]
pub enum TerrainEntity<'a> {
    /// Static box around the whole terrain.
    Bounds(Aabb),
    Mesh(&'a TerrainMesh),
}

struct CameraEntry {
    camera: Rc<dyn TerrainCamera>,
    start: Vec2,
    rings: RingSet,
    alive: u64,
}

/// Heightfield job in flight for a ring.
#[derive(Clone, Copy, Debug)]
struct PendingMesh {
    ticket: RingTicket,
    width: u32,
    height: u32,
}

const FALLBACK_COLOR: Vec4 = Vec4::new(0.7, 0.7, 0.5, 1.0);

/// Scene object streaming a terrain around every camera that looks at it.
pub struct TerrainNode {
    name: String,
    position: Vec3,
    settings: TerrainSettings,
    sampler: HeightSampler,
    cameras: BTreeMap<CameraId, CameraEntry>,
    index_cache: TileCache,
    worker: WorkerDispatch<PendingMesh>,
    quad: Option<VertexBufferHandle>,
    bounds: Aabb,
    frame: u64,
    next_ring_id: u64,
}

impl TerrainNode {
    pub fn new(name: &str, desc: TerrainDescription, settings: TerrainSettings) -> Result<Self> {
        let sampler = HeightSampler::new(desc, settings.max_fetch_attempts)?;
        let desc = sampler.description();

        let ub = desc.unitbase as f32;
        let vmax = Vec3::new(
            0.5 * desc.width() as f32 * ub * desc.scale[0],
            255.0 * desc.base_hscale * desc.scale[1],
            0.5 * desc.height() as f32 * ub * desc.scale[0],
        );
        let bounds = Aabb::new(Vec3::new(-vmax.x, 0.0, -vmax.z), vmax);

        info!(
            "terrain '{}': {}x{} tiles, unitbase {}, {} LODs",
            name,
            desc.width(),
            desc.height(),
            desc.unitbase,
            sampler.lod_count()
        );

        let mut worker = WorkerDispatch::new();
        if settings.use_worker {
            worker.start()?;
        }

        Ok(Self {
            name: name.to_string(),
            position: Vec3::ZERO,
            sampler,
            settings,
            cameras: BTreeMap::new(),
            index_cache: TileCache::new(),
            worker,
            quad: None,
            bounds,
            frame: 0,
            next_ring_id: 0,
        })
    }

    pub fn load(name: &str, path: impl AsRef<Path>, settings: TerrainSettings) -> Result<Self> {
        Self::new(name, load_description(path)?, settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Terrain nodes only translate, they never rotate or scale.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn settings(&self) -> &TerrainSettings {
        &self.settings
    }

    pub fn sampler(&self) -> &HeightSampler {
        &self.sampler
    }

    pub fn index_cache(&self) -> &TileCache {
        &self.index_cache
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn rings(&self, camera: CameraId) -> Option<&RingSet> {
        self.cameras.get(&camera).map(|entry| &entry.rings)
    }

    pub fn set_camera_timeout(&mut self, frames: u64) {
        self.settings.camera_timeout = frames;
    }

    pub fn set_update_threshold(&mut self, tiles: f32) {
        self.settings.update_threshold = tiles;
    }

    pub fn set_no_mans_border(&mut self, tiles: f32) {
        self.settings.no_mans_border = tiles;
    }

    pub fn use_vertex_fetch(&self) -> bool {
        self.settings.use_vertex_fetch
    }

    /// Switching modes throws away all per-camera geometry.
    pub fn set_use_vertex_fetch(&mut self, enabled: bool, backend: &mut impl GeometryBackend) {
        if enabled == self.settings.use_vertex_fetch {
            return;
        }
        self.drop_all_data(backend);
        self.settings.use_vertex_fetch = enabled;
    }

    pub fn use_worker(&self) -> bool {
        self.settings.use_worker
    }

    pub fn set_use_worker(
        &mut self,
        enabled: bool,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        if enabled == self.settings.use_worker {
            return Ok(());
        }
        self.drop_all_data(backend);
        self.settings.use_worker = enabled;
        if enabled {
            self.worker.start()
        } else {
            self.worker.stop();
            Ok(())
        }
    }

    pub fn worker_running(&self) -> bool {
        self.worker.is_running()
    }

    /// The terrain itself is never culled, its meshes are culled one by one.
    pub fn cull(&self) -> Visibility {
        Visibility::Partial
    }

    /// Renderables for `camera`: the bounding entity followed by every ring
    /// mesh. The first query for a camera sets up its rings.
    pub fn active_entities(&mut self, camera: &Rc<dyn TerrainCamera>) -> Vec<TerrainEntity<'_>> {
        let id = camera.id();
        let frame = self.frame;
        let lod_count = self.sampler.lod_count();
        let next_ring_id = &mut self.next_ring_id;

        let entry = self.cameras.entry(id).or_insert_with(|| {
            debug!("terrain: creating terrain data for camera {}", camera.name());
            CameraEntry {
                camera: camera.clone(),
                start: Vec2::splat(1e10),
                rings: RingSet::new(id, lod_count, next_ring_id),
                alive: frame,
            }
        });
        // Queried this frame, keep it.
        entry.alive = frame;
        let entry: &CameraEntry = entry;

        let mut entities = vec![TerrainEntity::Bounds(self.bounds)];
        entities.extend(entry.rings.meshes().map(TerrainEntity::Mesh));
        entities
    }

    /// Terrain height below a world position, `None` near the terrain edge
    /// or while no height data is resident.
    pub fn world_height(&self, x: f32, z: f32) -> Option<f32> {
        let w = self.sampler.width() as f32;
        let h = self.sampler.height() as f32;
        let b = self.settings.no_mans_border;

        let tile = self
            .sampler
            .local_to_tile(Vec2::new(x - self.position.x, z - self.position.z));
        if tile.x < b || tile.x >= w - b || tile.y < b || tile.y >= h - b {
            return None;
        }
        self.sampler
            .height_at(tile.x, tile.y)
            .map(|height| height + self.position.y)
    }

    /// Advances one frame: applies finished fetches and jobs, moves rings
    /// after their cameras, admits one heightmap fetch and evicts stale
    /// cameras.
    pub fn update(
        &mut self,
        backend: &mut impl GeometryBackend,
        source: &mut impl HeightmapSource,
    ) -> Result<()> {
        self.frame += 1;

        for arrival in self.sampler.poll_fetches() {
            self.apply_tile(arrival.request.ticket, arrival.tile, backend)?;
        }

        for (pending, output) in self.worker.poll()? {
            self.apply_job(pending, output, backend)?;
        }

        let threshold = self.settings.effective_update_threshold();
        let ids: Vec<CameraId> = self.cameras.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.cameras.get_mut(&id) else {
                continue;
            };
            let pos = entry.camera.world_position() - self.position;
            let tile = self.sampler.local_to_tile(Vec2::new(pos.x, pos.z));
            let delta = tile - entry.start;
            if delta.x.abs() <= threshold && delta.y.abs() <= threshold {
                continue;
            }
            entry.start = tile;
            let lods = entry.rings.len() as u32;
            for lod in 0..lods {
                self.request_ring(id, lod, tile, backend)?;
            }
        }

        self.sampler.tick(source);
        self.cleanup_cameras(backend);
        Ok(())
    }

    /// Releases every camera's rings and the shared quad.
    pub fn drop_all_data(&mut self, backend: &mut impl GeometryBackend) {
        let ids: Vec<CameraId> = self.cameras.keys().copied().collect();
        for id in ids {
            self.remove_camera(id, backend);
        }
        if let Some(quad) = self.quad.take() {
            backend.release_vertex_buffer(quad);
        }
    }

    fn remove_camera(&mut self, id: CameraId, backend: &mut impl GeometryBackend) {
        let Some(mut entry) = self.cameras.remove(&id) else {
            return;
        };
        debug!("terrain: dropping data for camera {}", entry.camera.name());
        for buffer in entry.rings.dispose() {
            backend.release_vertex_buffer(buffer);
        }
    }

    fn cleanup_cameras(&mut self, backend: &mut impl GeometryBackend) {
        let frame = self.frame;
        let timeout = self.settings.camera_timeout;
        let stale: Vec<CameraId> = self
            .cameras
            .iter()
            .filter(|(_, entry)| {
                frame.saturating_sub(entry.alive) > timeout || !entry.camera.has_viewport()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.remove_camera(id, backend);
        }
    }

    fn material_flags(&self) -> MaterialFlags {
        if self.settings.use_vertex_fetch {
            MaterialFlags::ENABLE_VERTEX_FETCH
        } else {
            MaterialFlags::empty()
        }
    }

    fn request_ring(
        &mut self,
        camera: CameraId,
        lod: u32,
        tile: Vec2,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        let flags = self.material_flags();
        let Some(ring) = self
            .cameras
            .get_mut(&camera)
            .and_then(|entry| entry.rings.ring_mut(lod))
        else {
            return Ok(());
        };

        // Resolve the material before the tile to overlap the loads.
        if ring.material().is_none() {
            let material = self.sampler.material(lod, flags).unwrap_or_else(|| {
                error!(
                    "terrain data provider failed to deliver a material for LOD {} with behaviour flags: {:?}",
                    lod, flags
                );
                Material::flat_color(FALLBACK_COLOR)
            });
            ring.set_material(material);
        }

        ring.update(tile);
        let request = LodRequest {
            ticket: ring.ticket(camera),
            rect: ring.request_rect(),
            lod,
        };

        match self.sampler.resolve_lod(&request) {
            LodResolution::Ready(tile) => self.apply_tile(request.ticket, Ok(tile), backend),
            LodResolution::Pending => Ok(()),
            LodResolution::Unavailable => {
                if let Some(ring) = self.ring_mut(&request.ticket) {
                    ring.fail(request.ticket.generation);
                }
                Ok(())
            }
        }
    }

    fn ring_mut(&mut self, ticket: &RingTicket) -> Option<&mut TerrainRing> {
        self.cameras
            .get_mut(&ticket.camera)
            .and_then(|entry| entry.rings.ring_for(ticket))
    }

    fn apply_tile(
        &mut self,
        ticket: RingTicket,
        tile: Result<TileDescriptor>,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        let Some(ring) = self.ring_mut(&ticket) else {
            debug!("dropping terrain tile for a ring that no longer exists");
            return Ok(());
        };
        if !ring.accepts(&ticket) {
            return Ok(());
        }

        let tile = match tile {
            Ok(tile) => tile,
            Err(err) => {
                warn!("terrain LOD {} has no height data: {}", ticket.lod, err);
                ring.fail(ticket.generation);
                return Ok(());
            }
        };

        // The mode cannot have changed since the request, switching drops
        // every ring.
        if self.settings.use_vertex_fetch {
            self.build_vertex_fetch_mesh(ticket, &tile, backend)
        } else {
            self.build_heightfield_mesh(ticket, &tile, backend)
        }
    }

    fn shared_quad(&mut self, backend: &mut impl GeometryBackend) -> Result<VertexBufferHandle> {
        if let Some(quad) = self.quad {
            return Ok(quad);
        }
        let vertices = vertex_fetch_quad(self.sampler.unitbase());
        let quad = backend.create_vertex_buffer(&vertices, BufferUsage::Static)?;
        debug!("created vertex fetch quad with {} vertices", vertices.len());
        self.quad = Some(quad);
        Ok(quad)
    }

    fn build_vertex_fetch_mesh(
        &mut self,
        ticket: RingTicket,
        tile: &TileDescriptor,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        let quad = self.shared_quad(backend)?;
        let ub = self.sampler.unitbase();
        let params = self.sampler.vertex_fetch_params(tile);

        let half = 0.5 * ub as f32 * params.scale.x;
        let bounds = Aabb::new(
            params.wpos - Vec3::new(half, 0.0, half),
            params.wpos + Vec3::new(half, params.scale.y, half),
        );

        let Some(entry) = self.cameras.get_mut(&ticket.camera) else {
            return Ok(());
        };
        let lod = ticket.lod;
        let needs_mesh = entry.rings.ring(lod).is_some_and(|ring| ring.mesh().is_none());
        if needs_mesh {
            let key = entry.rings.index_key(lod, [ub, ub]);
            let indices = self.index_cache.get_or_create(key, backend)?;
            if let Some(ring) = entry.rings.ring_mut(lod) {
                let material = ring
                    .material()
                    .cloned()
                    .unwrap_or_else(|| Material::flat_color(FALLBACK_COLOR));
                ring.set_mesh(TerrainMesh {
                    vertex_buffer: quad,
                    owns_vertex_buffer: false,
                    indices,
                    grid: [ub, ub],
                    material,
                    bounds: None,
                });
            }
        }

        if let Some(ring) = entry.rings.ring_mut(lod) {
            if let Some(mesh) = ring.mesh_mut() {
                params.apply(&mut mesh.material);
                mesh.bounds = Some(bounds);
            }
            ring.mark_applied(ticket.generation);
        }
        self.present(ticket, backend)
    }

    fn build_heightfield_mesh(
        &mut self,
        ticket: RingTicket,
        tile: &TileDescriptor,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        let mut field = self.sampler.sample_heightfield(tile);
        let origin = self.sampler.tile_to_local(field.origin);
        field.translate(Vec3::new(origin.x, 0.0, origin.y));

        let pending = PendingMesh {
            ticket,
            width: field.width,
            height: field.height,
        };
        let job = Job::HeightfieldTangentSpace {
            positions: field.positions,
            width: field.width,
            height: field.height,
        };
        match self.worker.dispatch(job, pending) {
            Dispatched::Completed(pending, output) => self.apply_job(pending, output, backend),
            Dispatched::Queued(job_id) => {
                debug!("terrain LOD {} queued as job {}", ticket.lod, job_id);
                Ok(())
            }
        }
    }

    fn apply_job(
        &mut self,
        pending: PendingMesh,
        output: JobOutput,
        backend: &mut impl GeometryBackend,
    ) -> Result<()> {
        let PendingMesh {
            ticket,
            width,
            height,
        } = pending;
        let JobOutput::TangentSpace(space) = output;

        let Some(entry) = self.cameras.get_mut(&ticket.camera) else {
            return Ok(());
        };
        let lod = ticket.lod;
        let Some(ring) = entry.rings.ring_for(&ticket) else {
            return Ok(());
        };
        if !ring.accepts(&ticket) {
            return Ok(());
        }

        let uvs = heightfield_uvs(width, height, (1u64 << lod) as f32);
        let vertices = assemble_vertices(&space, &uvs);
        let bounds = Aabb::from_points(space.positions.iter().copied());
        let grid = [width.saturating_sub(1), height.saturating_sub(1)];

        match ring.mesh_mut() {
            Some(mesh) if mesh.grid == grid => {
                backend.update_vertex_buffer(mesh.vertex_buffer, &vertices)?;
                mesh.bounds = bounds;
            }
            current => {
                // First build, or the serving map changed resolution.
                if let Some(old) = current.filter(|mesh| mesh.owns_vertex_buffer) {
                    backend.release_vertex_buffer(old.vertex_buffer);
                }
                let vertex_buffer = backend.create_vertex_buffer(&vertices, BufferUsage::Dynamic)?;
                let key = entry.rings.index_key(lod, grid);
                let indices = self.index_cache.get_or_create(key, backend)?;
                if let Some(ring) = entry.rings.ring_mut(lod) {
                    let material = ring
                        .material()
                        .cloned()
                        .unwrap_or_else(|| Material::flat_color(FALLBACK_COLOR));
                    ring.set_mesh(TerrainMesh {
                        vertex_buffer,
                        owns_vertex_buffer: true,
                        indices,
                        grid,
                        material,
                        bounds,
                    });
                }
            }
        }

        if let Some(ring) = entry.rings.ring_mut(lod) {
            debug!(
                "(re-)generate terrain tile: lod={}, start={:?}, camera={:?}",
                lod,
                ring.start(),
                ticket.camera
            );
            ring.mark_applied(ticket.generation);
        }
        self.present(ticket, backend)
    }

    /// Presents a ring and shrinks the holes of coarse rings that were
    /// waiting on it.
    fn present(&mut self, ticket: RingTicket, backend: &mut impl GeometryBackend) -> Result<()> {
        let Some(entry) = self.cameras.get_mut(&ticket.camera) else {
            return Ok(());
        };
        for owner in entry.rings.set_present(ticket.lod) {
            let Some(grid) = entry
                .rings
                .ring(owner)
                .and_then(|ring| ring.mesh())
                .map(|mesh| mesh.grid)
            else {
                continue;
            };
            let key = entry.rings.index_key(owner, grid);
            let indices = self.index_cache.get_or_create(key, backend)?;
            if let Some(mesh) = entry.rings.ring_mut(owner).and_then(|ring| ring.mesh_mut()) {
                mesh.indices = indices;
            }
        }
        Ok(())
    }
}
