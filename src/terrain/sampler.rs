//! Height data access for a terrain.
//!
//! The [`HeightSampler`] owns the terrain description and every heightmap
//! that has been loaded for it. Rings ask it for LOD tiles through
//! [`HeightSampler::resolve_lod`]. Maps that are not resident yet are queued
//! and fetched one per [`tick`](HeightSampler::tick), smallest first, and
//! the waiting requests come back out of
//! [`poll_fetches`](HeightSampler::poll_fetches) once their data is in.
use crossbeam_channel::{unbounded, Receiver};
use glam::{Vec2, Vec3, Vec4};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{Error, Result};
use super::geometry::Heightfield;
use super::images::{
    FetchRequest, FetchResult, FetchSender, HeightImage, HeightmapSource, TextureFlags,
};
use super::json::{MapEntry, MaterialEntry, TerrainDescription};
use super::material::{
    fix_texture_paths, join_url, Material, MaterialFlags, Pass, PassState, ShaderConstant,
    VERTEX_FETCH_DEFINE,
};
use super::ring::RingTicket;

const SAMPLE_3X3_WEIGHTS: [[f32; 3]; 3] = [[0.05, 0.1, 0.05], [0.1, 0.4, 0.1], [0.05, 0.1, 0.05]];

/// Rectangle in tile units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodRequest {
    pub ticket: RingTicket,
    pub rect: TileRect,
    pub lod: u32,
}

/// A request bound to the map that will serve it.
#[derive(Clone, Debug)]
pub struct TileDescriptor {
    pub rect: TileRect,
    pub lod: u32,
    pub map_size: [u32; 2],
    pub image: Arc<HeightImage>,
}

#[derive(Debug)]
pub enum LodResolution {
    Ready(TileDescriptor),
    Pending,
    Unavailable,
}

#[derive(Debug)]
pub struct TileArrival {
    pub request: LodRequest,
    pub tile: Result<TileDescriptor>,
}

/// Per-draw constants for a vertex fetch ring.
#[derive(Clone, Debug)]
pub struct VertexFetchParams {
    pub range: Vec4,
    pub scale: Vec3,
    pub wpos: Vec3,
    pub uvdelta: Vec4,
    pub uvoffset: Vec2,
    pub height_map: Arc<HeightImage>,
}

impl VertexFetchParams {
    pub fn apply(&self, material: &mut Material) {
        material.set("_tvf_range", ShaderConstant::Vec4(self.range));
        material.set("_tvf_scale", ShaderConstant::Vec3(self.scale));
        material.set("_tvf_wpos", ShaderConstant::Vec3(self.wpos));
        material.set("_tvf_uvdelta", ShaderConstant::Vec4(self.uvdelta));
        material.set("_tvf_uvoffset", ShaderConstant::Vec2(self.uvoffset));
        material.set(
            "_tvf_height_map",
            ShaderConstant::Heightmap(self.height_map.clone()),
        );
    }
}

struct MapSlot {
    entry: MapEntry,
    image: Option<Arc<HeightImage>>,
    attempts: u32,
    failed: bool,
}

struct PendingFetch {
    map: usize,
    waiters: Vec<LodRequest>,
    in_flight: bool,
}

pub struct HeightSampler {
    desc: TerrainDescription,
    url_root: String,
    lod_count: u32,
    max_fetch_attempts: u32,
    maps: Vec<MapSlot>,
    maps_by_size: HashMap<(u32, u32), usize>,
    fetch_queue: Vec<PendingFetch>,
    materials: HashMap<(u32, MaterialFlags), Material>,
    done_tx: FetchSender,
    done_rx: Receiver<FetchResult>,
}

impl HeightSampler {
    /// Rejects descriptions that fail [`TerrainDescription::validate`].
    pub fn new(desc: TerrainDescription, max_fetch_attempts: u32) -> Result<Self> {
        desc.validate()?;
        let (done_tx, done_rx) = unbounded();
        let maps = desc
            .maps
            .iter()
            .map(|entry| MapSlot {
                entry: entry.clone(),
                image: None,
                attempts: 0,
                failed: false,
            })
            .collect();

        Ok(Self {
            url_root: desc.url_root.clone().unwrap_or_default(),
            lod_count: desc.lod_count(),
            max_fetch_attempts: max_fetch_attempts.max(1),
            maps,
            maps_by_size: HashMap::new(),
            fetch_queue: Vec::new(),
            materials: HashMap::new(),
            done_tx,
            done_rx,
            desc,
        })
    }

    pub fn description(&self) -> &TerrainDescription {
        &self.desc
    }

    pub fn lod_count(&self) -> u32 {
        self.lod_count
    }

    pub fn width(&self) -> u32 {
        self.desc.width()
    }

    pub fn height(&self) -> u32 {
        self.desc.height()
    }

    pub fn unitbase(&self) -> u32 {
        self.desc.unitbase
    }

    pub fn scale(&self) -> Vec3 {
        Vec3::from_array(self.desc.scale)
    }

    /// World units covered by one tile along x and z.
    pub fn tile_extent(&self) -> f32 {
        self.desc.unitbase as f32 * self.desc.scale[0]
    }

    /// Node-local (x, z) of a tile-space point.
    pub fn tile_to_local(&self, tile: Vec2) -> Vec2 {
        let half = Vec2::new(self.width() as f32, self.height() as f32) * 0.5;
        (tile - half) * self.tile_extent()
    }

    pub fn local_to_tile(&self, local: Vec2) -> Vec2 {
        let half = Vec2::new(self.width() as f32, self.height() as f32) * 0.5;
        local / self.tile_extent() + half
    }

    /// Number of maps queued or in flight.
    pub fn pending_fetches(&self) -> usize {
        self.fetch_queue.len()
    }

    pub fn is_map_loaded(&self, size: [u32; 2]) -> bool {
        self.maps_by_size.contains_key(&(size[0], size[1]))
    }

    /// Finds the loaded map of the given size, halving the size until one
    /// is found.
    fn find_lod(&self, mut w: u32, mut h: u32) -> Option<usize> {
        while w > 0 && h > 0 {
            if let Some(&map) = self.maps_by_size.get(&(w, h)) {
                return Some(map);
            }
            w /= 2;
            h /= 2;
        }
        None
    }

    /// Declared map of exactly `w * h` that can still be fetched.
    fn fetchable_map(&self, w: u32, h: u32) -> Option<usize> {
        self.maps.iter().position(|slot| {
            slot.entry.img.is_some() && !slot.failed && slot.entry.size == [w, h]
        })
    }

    /// Closest declared map at or below the requested size.
    fn fetch_candidate(&self, mut w: u32, mut h: u32) -> Option<usize> {
        while w > 0 && h > 0 {
            if let Some(map) = self.fetchable_map(w, h) {
                return Some(map);
            }
            w /= 2;
            h /= 2;
        }
        None
    }

    /// Queues `map` for fetching. A ring waits at most once per map, a
    /// newer request replaces the one it had queued.
    fn enqueue(&mut self, map: usize, waiter: Option<LodRequest>) {
        if let Some(pending) = self.fetch_queue.iter_mut().find(|p| p.map == map) {
            let Some(waiter) = waiter else {
                return;
            };
            let queued = pending.waiters.iter_mut().find(|w| {
                w.ticket.camera == waiter.ticket.camera && w.ticket.ring == waiter.ticket.ring
            });
            match queued {
                Some(queued) => *queued = waiter,
                None => pending.waiters.push(waiter),
            }
            return;
        }
        self.fetch_queue.push(PendingFetch {
            map,
            waiters: waiter.into_iter().collect(),
            in_flight: false,
        });
    }

    fn describe(&self, request: &LodRequest, map: usize) -> Option<TileDescriptor> {
        let slot = &self.maps[map];
        Some(TileDescriptor {
            rect: request.rect,
            lod: request.lod,
            map_size: slot.entry.size,
            image: slot.image.clone()?,
        })
    }

    /// Binds a request to the map serving its LOD. Missing maps are queued
    /// for fetching and the request waits on them.
    pub fn resolve_lod(&mut self, request: &LodRequest) -> LodResolution {
        let [wx, hx] = self.desc.lod_size(request.lod);

        if let Some(map) = self.find_lod(wx, hx) {
            if self.maps[map].entry.size != [wx, hx] {
                // Serve coarser data now but keep the exact map coming.
                if let Some(exact) = self.fetchable_map(wx, hx) {
                    if self.maps[exact].image.is_none() {
                        self.enqueue(exact, None);
                    }
                }
            }
            if let Some(tile) = self.describe(request, map) {
                return LodResolution::Ready(tile);
            }
        }

        match self.fetch_candidate(wx, hx) {
            Some(map) => {
                self.enqueue(map, Some(*request));
                LodResolution::Pending
            }
            None => {
                debug!("no heightmap can serve terrain LOD {} ({}x{})", request.lod, wx, hx);
                LodResolution::Unavailable
            }
        }
    }

    /// Admits at most one queued fetch, preferring the smallest map.
    pub fn tick(&mut self, source: &mut impl HeightmapSource) -> bool {
        let mut smallest = u64::MAX;
        let mut pick = None;
        for (i, pending) in self.fetch_queue.iter().enumerate() {
            if pending.in_flight {
                continue;
            }
            let [w, h] = self.maps[pending.map].entry.size;
            let area = w as u64 * h as u64;
            if area < smallest {
                smallest = area;
                pick = Some(i);
            }
        }

        let Some(i) = pick else {
            return false;
        };
        let pending = &mut self.fetch_queue[i];
        pending.in_flight = true;

        let slot = &self.maps[pending.map];
        let img = slot.entry.img.clone().unwrap_or_default();
        let request = FetchRequest {
            map: pending.map,
            url: join_url(&self.url_root, &img),
            flags: TextureFlags::heightmap(),
            extent: [
                slot.entry.size[0] * self.desc.unitbase,
                slot.entry.size[1] * self.desc.unitbase,
            ],
        };
        debug!(
            "fetching terrain heightmap {} ({} waiters, attempt {})",
            request.url,
            pending.waiters.len(),
            slot.attempts + 1
        );
        source.fetch(request, self.done_tx.clone());
        true
    }

    /// Applies finished fetches and re-resolves the requests waiting on them.
    pub fn poll_fetches(&mut self) -> Vec<TileArrival> {
        let mut arrivals = Vec::new();
        while let Ok(FetchResult { map, image }) = self.done_rx.try_recv() {
            let Some(queue_pos) = self.fetch_queue.iter().position(|p| p.map == map) else {
                warn!("heightmap fetch for map {} completed without a request", map);
                continue;
            };

            let waiters = match image {
                Ok(image) => {
                    let slot = &mut self.maps[map];
                    info!(
                        "terrain heightmap {} loaded ({}x{})",
                        slot.entry.img.as_deref().unwrap_or("?"),
                        image.width(),
                        image.height()
                    );
                    slot.image = Some(Arc::new(image));
                    self.maps_by_size
                        .insert((slot.entry.size[0], slot.entry.size[1]), map);
                    self.fetch_queue.remove(queue_pos).waiters
                }
                Err(err) => {
                    let slot = &mut self.maps[map];
                    slot.attempts += 1;
                    warn!(
                        "failed to fetch terrain heightmap {} (attempt {}/{}): {}",
                        slot.entry.img.as_deref().unwrap_or("?"),
                        slot.attempts,
                        self.max_fetch_attempts,
                        err
                    );
                    if slot.attempts < self.max_fetch_attempts {
                        self.fetch_queue[queue_pos].in_flight = false;
                        continue;
                    }
                    slot.failed = true;
                    self.fetch_queue.remove(queue_pos).waiters
                }
            };

            for waiter in waiters {
                match self.resolve_lod(&waiter) {
                    LodResolution::Ready(tile) => arrivals.push(TileArrival {
                        request: waiter,
                        tile: Ok(tile),
                    }),
                    LodResolution::Pending => {}
                    LodResolution::Unavailable => arrivals.push(TileArrival {
                        request: waiter,
                        tile: Err(Error::loading(
                            format!("terrain LOD {}", waiter.lod),
                            self.maps[map].entry.img.clone().unwrap_or_default(),
                        )),
                    }),
                }
            }
        }
        arrivals
    }

    /// Builds the vertex grid for a tile. Positions are relative to the
    /// tile-space `origin` of the returned heightfield.
    pub fn sample_heightfield(&self, tile: &TileDescriptor) -> Heightfield {
        let desc = &self.desc;
        let real_scale = tile.map_size[0] as f32 / desc.width() as f32;

        let x = (tile.rect.x * 2.0).floor() * 0.5;
        let y = (tile.rect.y * 2.0).floor() * 0.5;
        let w = tile.rect.w.floor().max(0.0) as u32;
        let h = tile.rect.h.floor().max(0.0) as u32;

        let px_per_tile = desc.unitbase as f32 * real_scale;
        let cells_per_tile = px_per_tile.floor().max(1.0) as u32;
        let pixel_step = px_per_tile as f64 / cells_per_tile as f64;

        let xx = (x * cells_per_tile as f32).floor() as i64;
        let yy = (y * cells_per_tile as f32).floor() as i64;
        let ww = w * cells_per_tile;
        let hh = h * cells_per_tile;

        let spacing = self.tile_extent() / cells_per_tile as f32;
        let ys = desc.base_hscale * desc.scale[1];
        let (iw, ih) = (tile.image.width() as i64, tile.image.height() as i64);

        let to_pixel = |c: i64| (c as f64 * pixel_step).floor() as i64;
        let (px0, py0) = (to_pixel(xx), to_pixel(yy));
        let (px1, py1) = (to_pixel(xx + ww as i64), to_pixel(yy + hh as i64));
        if px0 < 0 || py0 < 0 || px1 >= iw || py1 >= ih {
            debug!(
                "heightfield out of range: x={}..{} y={}..{} image={}x{}",
                px0, px1, py0, py1, iw, ih
            );
        }

        let mut positions = Vec::with_capacity(((ww + 1) * (hh + 1)) as usize);
        for j in 0..=hh {
            let py = to_pixel(yy + j as i64);
            for i in 0..=ww {
                let px = to_pixel(xx + i as i64);
                let height = if px >= 0 && px < iw && py >= 0 && py < ih {
                    tile.image.pixel(px as u32, py as u32) as f32 * ys
                } else {
                    desc.default_height
                };
                positions.push(Vec3::new(i as f32 * spacing, height, j as f32 * spacing));
            }
        }

        Heightfield {
            positions,
            width: ww + 1,
            height: hh + 1,
            origin: Vec2::new(
                xx as f32 / cells_per_tile as f32,
                yy as f32 / cells_per_tile as f32,
            ),
        }
    }

    /// Shader constants placing the shared unit quad over `tile`.
    pub fn vertex_fetch_params(&self, tile: &TileDescriptor) -> VertexFetchParams {
        let desc = &self.desc;
        let (sx, sy) = (desc.width() as f32, desc.height() as f32);
        let ilod = (1u64 << tile.lod) as f32;
        let ub = desc.unitbase as f32;
        let tex = &tile.image;

        let (ox, oy) = (tile.rect.x, tile.rect.y);
        let x = (ox * ub).floor() / ub;
        let y = (oy * ub).floor() / ub;
        let w = tile.rect.w.floor();
        let h = tile.rect.h.floor();

        // Texture data may be cropped or padded relative to the texture.
        let bias = tex.padding_compensation();
        let mut range =
            Vec4::new(x / sx, y / sy, w / sx, h / sy) * Vec4::new(bias.x, bias.y, bias.x, bias.y);
        // Sample texel centres.
        range.x += 0.5 / tex.texture_width() as f32;
        range.y += 0.5 / tex.texture_height() as f32;

        let centre = self.tile_to_local(Vec2::new(x + w * 0.5, y + h * 0.5));
        let scale = Vec3::new(
            ilod * desc.scale[0],
            255.0 * desc.base_hscale * desc.scale[1],
            ilod * desc.scale[0],
        );

        VertexFetchParams {
            range,
            scale,
            wpos: Vec3::new(centre.x, 0.0, centre.y),
            uvdelta: Vec4::new(range.z / ub, range.w / ub, 1.0, 0.0),
            uvoffset: Vec2::new(x - ox.floor(), y - oy.floor()),
            height_map: tex.clone(),
        }
    }

    /// Smoothed terrain height at a tile-space position, read from the
    /// finest resident map. `None` until any map is loaded.
    pub fn height_at(&self, x: f32, y: f32) -> Option<f32> {
        let map = self.find_lod(self.width(), self.height())?;
        let image = self.maps[map].image.as_ref()?;

        let xx = (image.width() as f64 * x as f64 / self.width() as f64).floor() as i64;
        let yy = (image.height() as f64 * y as f64 / self.height() as f64).floor() as i64;

        let hs = self.desc.base_hscale;
        let mut h = 0.0;
        for n in -1i64..=1 {
            for m in -1i64..=1 {
                let weight = SAMPLE_3X3_WEIGHTS[(n + 1) as usize][(m + 1) as usize];
                h += image.pixel_clamped(xx + n, yy + m) as f32 * hs * weight;
            }
        }
        Some(h * self.desc.scale[1])
    }

    /// Material for a LOD, following clone references. Returned materials
    /// share their render state with the cached entry.
    pub fn material(&mut self, lod: u32, flags: MaterialFlags) -> Option<Material> {
        if let Some(material) = self.materials.get(&(lod, flags)) {
            return Some(material.clone());
        }

        let mut current = lod as usize;
        let mut visited = HashSet::new();
        let (effect, mut constants, state) = loop {
            if !visited.insert(current) {
                error!("terrain material for LOD {} has a cyclic clonefrom chain", lod);
                return None;
            }
            match self.desc.materials.get(current)? {
                MaterialEntry::Clone { clonefrom } => current = *clonefrom,
                MaterialEntry::Effect {
                    effect,
                    constants,
                    state,
                } => break (effect.clone(), constants.clone(), state.clone()),
            }
        };

        fix_texture_paths(&mut constants, &self.url_root);

        let mut defines = BTreeSet::new();
        if flags.contains(MaterialFlags::ENABLE_VERTEX_FETCH) {
            defines.insert(VERTEX_FETCH_DEFINE.to_string());
        }

        let constants: BTreeMap<String, ShaderConstant> = constants
            .iter()
            .map(|(name, value)| (name.clone(), ShaderConstant::from(value)))
            .collect();

        let material = Material::new(vec![Pass {
            effect: join_url(&self.url_root, &effect),
            defines,
            constants,
            state: Arc::new(PassState::from_entry(state.as_ref())),
        }]);
        self.materials.insert((lod, flags), material.clone());
        Some(material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::node::CameraId;
    use crate::terrain::ring::RingId;
    use image::{GrayImage, Luma};

    fn desc(json: &str) -> TerrainDescription {
        TerrainDescription::from_json_str(json).unwrap()
    }

    fn request(lod: u32) -> LodRequest {
        LodRequest {
            ticket: RingTicket {
                camera: CameraId(1),
                ring: RingId(lod as u64),
                lod,
                generation: 1,
            },
            rect: TileRect {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
            },
            lod,
        }
    }

    fn gradient(w: u32, h: u32) -> HeightImage {
        HeightImage::new(
            GrayImage::from_fn(w, h, |x, y| Luma([((x + y) % 256) as u8])),
            [0, 0],
        )
    }

    #[test]
    fn kernel_weights_sum_to_one() {
        let sum: f32 = SAMPLE_3X3_WEIGHTS.iter().flatten().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tile_space_round_trip() {
        let sampler = HeightSampler::new(
            desc(r#"{"size": [64, 32], "unitbase": 8, "scale": [2.0, 1.0, 2.0]}"#),
            3,
        )
        .unwrap();
        assert_eq!(sampler.tile_to_local(Vec2::new(32.0, 16.0)), Vec2::ZERO);
        assert_eq!(sampler.tile_to_local(Vec2::new(33.0, 16.0)), Vec2::new(16.0, 0.0));
        let p = Vec2::new(12.25, 3.5);
        assert!((sampler.local_to_tile(sampler.tile_to_local(p)) - p).length() < 1e-4);
    }

    #[test]
    fn unavailable_without_usable_maps() {
        let mut sampler = HeightSampler::new(
            desc(
                r#"{"size": [64, 64], "unitbase": 8, "scale": [1,1,1],
                    "maps": [{"size": [64, 64]}]}"#,
            ),
            3,
        )
        .unwrap();
        assert!(matches!(sampler.resolve_lod(&request(0)), LodResolution::Unavailable));
        assert_eq!(sampler.pending_fetches(), 0);
    }

    #[test]
    fn fully_inside_reproduces_pixels() {
        let sampler = HeightSampler::new(
            desc(r#"{"size": [8, 8], "unitbase": 4, "scale": [1, 255, 1]}"#),
            3,
        )
        .unwrap();
        let tile = TileDescriptor {
            rect: TileRect { x: 1.0, y: 2.0, w: 1.0, h: 1.0 },
            lod: 0,
            map_size: [8, 8],
            image: Arc::new(gradient(33, 33)),
        };
        let hf = sampler.sample_heightfield(&tile);
        assert_eq!((hf.width, hf.height), (5, 5));
        assert_eq!(hf.origin, Vec2::new(1.0, 2.0));
        for j in 0..5u32 {
            for i in 0..5u32 {
                let expected = ((4 + i) + (8 + j)) as f32;
                let got = hf.positions[(j * 5 + i) as usize];
                assert!((got.y - expected).abs() < 1e-4, "({i},{j}) {} != {}", got.y, expected);
                assert_eq!(got.x, i as f32);
                assert_eq!(got.z, j as f32);
            }
        }
    }

    #[test]
    fn unvalidated_description_is_rejected() {
        let mut d = desc(r#"{"size": [8, 8], "unitbase": 4, "scale": [1,1,1]}"#);
        d.size = [0, 8];
        assert!(matches!(HeightSampler::new(d, 3), Err(Error::Config(_))));
    }

    #[test]
    fn material_cycle_yields_none() {
        let mut d = desc(r#"{"size": [8, 8], "unitbase": 4, "scale": [1,1,1]}"#);
        d.materials = vec![
            MaterialEntry::Clone { clonefrom: 1 },
            MaterialEntry::Clone { clonefrom: 0 },
        ];
        let mut sampler = HeightSampler::new(d, 3).unwrap();
        assert!(sampler.material(0, MaterialFlags::empty()).is_none());
    }
}
