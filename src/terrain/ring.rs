use glam::Vec2;
use std::sync::Arc;
use tracing::debug;

use super::backend::{Aabb, VertexBufferHandle};
use super::index_cache::{IndexBuffer, IndexKey};
use super::material::Material;
use super::node::CameraId;
use super::sampler::TileRect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RingId(pub u64);

/// Identifies the ring request a tile or job result belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RingTicket {
    pub camera: CameraId,
    pub ring: RingId,
    pub lod: u32,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingState {
    Idle,
    Requesting,
    Present,
}

/// Registered by a coarse ring on a finer ring it currently substitutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentListener {
    pub owner: u32,
}

#[derive(Debug)]
pub struct TerrainMesh {
    pub vertex_buffer: VertexBufferHandle,
    /// False for vertex fetch rings drawing the node's shared quad.
    pub owns_vertex_buffer: bool,
    pub indices: Arc<IndexBuffer>,
    /// Cell count of the grid the indices were built for.
    pub grid: [u32; 2],
    pub material: Material,
    pub bounds: Option<Aabb>,
}

/// One level of detail around one camera.
#[derive(Debug)]
pub struct TerrainRing {
    id: RingId,
    lod: u32,
    half_scale: f32,
    start: Vec2,
    state: RingState,
    presented: bool,
    substituted: bool,
    obsolete: bool,
    generation: u64,
    applied_generation: u64,
    listeners: Vec<PresentListener>,
    material: Option<Material>,
    mesh: Option<TerrainMesh>,
}

impl TerrainRing {
    pub fn new(id: RingId, lod: u32) -> Self {
        Self {
            id,
            lod,
            half_scale: 0.5 * (1u64 << lod) as f32,
            start: Vec2::splat(1e10),
            state: RingState::Idle,
            presented: false,
            substituted: false,
            obsolete: false,
            generation: 0,
            applied_generation: 0,
            listeners: Vec::new(),
            material: None,
            mesh: None,
        }
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    pub fn half_scale(&self) -> f32 {
        self.half_scale
    }

    pub fn start(&self) -> Vec2 {
        self.start
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    /// True once the ring has shown geometry. A ring that is rebuilding
    /// after a camera move keeps presenting its previous mesh.
    pub fn is_present(&self) -> bool {
        self.presented && !self.obsolete
    }

    pub fn is_substituted(&self) -> bool {
        self.substituted
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn listeners(&self) -> &[PresentListener] {
        &self.listeners
    }

    pub fn material(&self) -> Option<&Material> {
        self.material.as_ref()
    }

    pub fn set_material(&mut self, material: Material) {
        self.material = Some(material);
    }

    pub fn mesh(&self) -> Option<&TerrainMesh> {
        self.mesh.as_ref()
    }

    pub fn mesh_mut(&mut self) -> Option<&mut TerrainMesh> {
        self.mesh.as_mut()
    }

    pub fn set_mesh(&mut self, mesh: TerrainMesh) {
        self.mesh = Some(mesh);
    }

    /// Re-anchors the ring on a camera tile position and starts a new
    /// request generation.
    pub fn update(&mut self, camera_tile: Vec2) -> u64 {
        self.start = camera_tile - Vec2::splat(self.half_scale);
        self.generation += 1;
        self.state = RingState::Requesting;
        self.generation
    }

    /// Tile rectangle covered at the current anchor.
    pub fn request_rect(&self) -> TileRect {
        let side = (1u64 << self.lod) as f32;
        TileRect {
            x: self.start.x,
            y: self.start.y,
            w: side,
            h: side,
        }
    }

    pub fn ticket(&self, camera: CameraId) -> RingTicket {
        RingTicket {
            camera,
            ring: self.id,
            lod: self.lod,
            generation: self.generation,
        }
    }

    /// Whether a result for `ticket` may still be applied. Only the latest
    /// request of a live ring is applied, and only once.
    pub fn accepts(&self, ticket: &RingTicket) -> bool {
        !self.obsolete
            && ticket.ring == self.id
            && ticket.generation == self.generation
            && ticket.generation > self.applied_generation
    }

    pub fn mark_applied(&mut self, generation: u64) {
        self.applied_generation = self.applied_generation.max(generation);
    }

    /// The tile for `generation` will never arrive.
    pub fn fail(&mut self, generation: u64) {
        if self.state == RingState::Requesting && generation == self.generation {
            self.state = RingState::Idle;
        }
    }

    /// Marks the ring obsolete and hands back the vertex buffer it owns.
    pub fn dispose(&mut self) -> Option<VertexBufferHandle> {
        self.obsolete = true;
        self.state = RingState::Idle;
        self.listeners.clear();
        self.mesh
            .take()
            .filter(|mesh| mesh.owns_vertex_buffer)
            .map(|mesh| mesh.vertex_buffer)
    }
}

/// All rings of one camera, indexed by LOD.
#[derive(Debug)]
pub struct RingSet {
    camera: CameraId,
    rings: Vec<TerrainRing>,
}

impl RingSet {
    pub fn new(camera: CameraId, lod_count: u32, next_id: &mut u64) -> Self {
        let rings = (0..lod_count)
            .map(|lod| {
                let id = RingId(*next_id);
                *next_id += 1;
                TerrainRing::new(id, lod)
            })
            .collect();
        Self { camera, rings }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn rings(&self) -> &[TerrainRing] {
        &self.rings
    }

    pub fn ring(&self, lod: u32) -> Option<&TerrainRing> {
        self.rings.get(lod as usize)
    }

    pub fn ring_mut(&mut self, lod: u32) -> Option<&mut TerrainRing> {
        self.rings.get_mut(lod as usize)
    }

    /// Ring addressed by a ticket, if it is still the same ring.
    pub fn ring_for(&mut self, ticket: &RingTicket) -> Option<&mut TerrainRing> {
        self.rings
            .get_mut(ticket.lod as usize)
            .filter(|ring| ring.id == ticket.ring)
    }

    /// Index layout for the ring at `lod` with a `grid` of cells.
    ///
    /// The hole normally spans the centre half, where the next finer ring
    /// sits. Missing finer rings widen the coarse ring inwards, one halving
    /// step per missing LOD. Each ring covered that way is flagged
    /// substituted and gets a listener so the hole can shrink again.
    pub fn index_key(&mut self, lod: u32, grid: [u32; 2]) -> IndexKey {
        let [w, h] = grid;
        let lod_count = self.rings.len() as u32;
        let stitched = lod + 1 != lod_count;
        if lod == 0 {
            return IndexKey::full(w, h, stitched);
        }

        let (wf, hf) = (w as f32, h as f32);
        let (mut whs, mut hhs) = (wf / 4.0, hf / 4.0);
        let mut n = lod as i64 - 1;
        let mut dt = 8.0;
        let mut extend = false;
        while n >= 0 && !self.rings[n as usize].is_present() {
            n -= 1;
            whs += wf / dt;
            hhs += hf / dt;
            dt *= 2.0;
            extend = true;
        }
        // First ring the coarse ring substitutes for.
        let covered = if n < 0 {
            whs = wf / 2.0;
            hhs = hf / 2.0;
            0
        } else {
            n as usize + 1
        };
        let (whs, hhs) = (whs.floor() as u32, hhs.floor() as u32);

        if extend {
            debug!(
                "extending indices for lod {} down to cover lod {} as well",
                lod, covered
            );
            let listener = PresentListener { owner: lod };
            for nn in covered..lod as usize {
                let finer = &mut self.rings[nn];
                finer.substituted = true;
                if !finer.listeners.contains(&listener) {
                    finer.listeners.push(listener);
                }
            }
        }

        IndexKey {
            w,
            h,
            border_x: whs,
            border_y: hhs,
            hole_w: w.saturating_sub(whs * 2),
            hole_h: h.saturating_sub(hhs * 2),
            stitched,
        }
    }

    /// Moves the ring at `lod` to `Present` and runs its listeners. Returns
    /// the coarse rings whose holes should shrink now. The listeners of
    /// those rings are retired, every other listener stays registered.
    pub fn set_present(&mut self, lod: u32) -> Vec<u32> {
        let Some(ring) = self.rings.get_mut(lod as usize) else {
            return Vec::new();
        };
        ring.state = RingState::Present;
        ring.presented = true;
        ring.substituted = false;
        let listeners = ring.listeners.clone();

        let mut shrink = Vec::new();
        for listener in listeners {
            let owner = &self.rings[listener.owner as usize];
            if owner.obsolete || owner.mesh.is_none() {
                continue;
            }
            let finest = (0..listener.owner)
                .rev()
                .find(|&m| self.rings[m as usize].is_present())
                .unwrap_or(0);
            if finest == lod {
                debug!(
                    "shrinking indices for {} again now that lod {} is present",
                    listener.owner, lod
                );
                self.rings[lod as usize]
                    .listeners
                    .retain(|l| *l != listener);
                shrink.push(listener.owner);
            }
        }
        shrink
    }

    /// Disposes every ring, returning the vertex buffers to release.
    pub fn dispose(&mut self) -> Vec<VertexBufferHandle> {
        self.rings.iter_mut().filter_map(TerrainRing::dispose).collect()
    }

    pub fn meshes(&self) -> impl Iterator<Item = &TerrainMesh> {
        self.rings.iter().filter_map(|ring| ring.mesh.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::backend::IndexBufferHandle;

    fn set(lods: u32) -> RingSet {
        let mut next = 0;
        RingSet::new(CameraId(1), lods, &mut next)
    }

    fn dummy_mesh() -> TerrainMesh {
        TerrainMesh {
            vertex_buffer: VertexBufferHandle(1),
            owns_vertex_buffer: true,
            indices: Arc::new(IndexBuffer {
                handle: IndexBufferHandle(1),
                count: 0,
            }),
            grid: [32, 32],
            material: Material::new(Vec::new()),
            bounds: None,
        }
    }

    #[test]
    fn hole_covers_finer_ring_when_present() {
        let mut rings = set(4);
        rings.set_present(0);
        let key = rings.index_key(1, [32, 32]);
        assert_eq!((key.border_x, key.hole_w), (8, 16));
        assert!(key.stitched);
        assert!(rings.ring(0).unwrap().listeners().is_empty());
    }

    #[test]
    fn hole_shrinks_over_missing_rings() {
        let mut rings = set(4);
        rings.set_present(0);
        // LOD 1 and 2 missing: 8 + 4 + 2.
        let key = rings.index_key(3, [32, 32]);
        assert_eq!((key.border_x, key.hole_w), (14, 4));
        assert!(!key.stitched);
        for lod in 1..3 {
            let ring = rings.ring(lod).unwrap();
            assert!(ring.is_substituted());
            assert_eq!(ring.listeners(), &[PresentListener { owner: 3 }]);
        }
        assert!(rings.ring(0).unwrap().listeners().is_empty());
    }

    #[test]
    fn no_hole_without_any_finer_ring() {
        let mut rings = set(3);
        let key = rings.index_key(2, [32, 32]);
        assert_eq!((key.border_x, key.hole_w), (16, 0));
        // LOD 0 is substituted as well.
        assert!(rings.ring(0).unwrap().is_substituted());
    }

    #[test]
    fn listeners_are_registered_once() {
        let mut rings = set(3);
        rings.index_key(2, [32, 32]);
        rings.index_key(2, [32, 32]);
        assert_eq!(rings.ring(1).unwrap().listeners().len(), 1);
    }

    #[test]
    fn listener_retires_only_when_it_is_the_finest_present() {
        let mut rings = set(3);
        rings.index_key(2, [32, 32]);
        rings.ring_mut(2).unwrap().set_mesh(dummy_mesh());

        // LOD 0 presents first, LOD 1 is still missing so the nearest present
        // ring below 2 is 0: the listener on 0 retires.
        assert_eq!(rings.set_present(0), vec![2]);
        assert!(rings.ring(0).unwrap().listeners().is_empty());
        assert!(!rings.ring(0).unwrap().is_substituted());

        // LOD 1 still carries its listener and fires when it presents.
        assert_eq!(rings.set_present(1), vec![2]);
        assert!(rings.ring(1).unwrap().listeners().is_empty());
    }

    #[test]
    fn listener_without_owner_mesh_does_nothing() {
        let mut rings = set(3);
        rings.index_key(2, [32, 32]);
        assert!(rings.set_present(1).is_empty());
        assert_eq!(rings.ring(1).unwrap().listeners().len(), 1);
    }

    #[test]
    fn stale_and_disposed_results_are_rejected() {
        let mut rings = set(2);
        let ring = rings.ring_mut(1).unwrap();
        let first = ring.update(Vec2::new(10.0, 10.0));
        let old = ring.ticket(CameraId(1));
        let second = ring.update(Vec2::new(12.0, 10.0));
        let new = ring.ticket(CameraId(1));
        assert_eq!((first, second), (1, 2));
        assert_eq!(ring.start(), Vec2::new(11.0, 9.0));

        // Superseded before anything was applied.
        assert!(!ring.accepts(&old));
        assert!(ring.accepts(&new));
        ring.mark_applied(new.generation);
        assert!(!ring.accepts(&new));

        ring.dispose();
        let third = ring.update(Vec2::ZERO);
        assert!(third > second);
        assert!(!ring.accepts(&ring.ticket(CameraId(1))));
    }

    #[test]
    fn dispose_returns_owned_buffers_only() {
        let mut rings = set(2);
        rings.ring_mut(0).unwrap().set_mesh(dummy_mesh());
        let mut shared = dummy_mesh();
        shared.owns_vertex_buffer = false;
        rings.ring_mut(1).unwrap().set_mesh(shared);
        assert_eq!(rings.dispose(), vec![VertexBufferHandle(1)]);
        assert!(rings.meshes().next().is_none());
    }
}
