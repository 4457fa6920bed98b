use glam::{Vec2, Vec3};
use rayon::prelude::*;

use super::backend::TerrainVertex;

/// Grid of terrain vertices sampled from a heightmap. `width` and `height`
/// count vertices, so the grid has `(width - 1) * (height - 1)` cells.
#[derive(Debug, Clone)]
pub struct Heightfield {
    pub positions: Vec<Vec3>,
    pub width: u32,
    pub height: u32,
    /// Tile-space coordinate of the first vertex.
    pub origin: Vec2,
}

impl Heightfield {
    pub fn cells(&self) -> [u32; 2] {
        [self.width.saturating_sub(1), self.height.saturating_sub(1)]
    }

    pub fn translate(&mut self, offset: Vec3) {
        for p in &mut self.positions {
            *p += offset;
        }
    }
}

/// Normals, tangents and bitangents of a heightfield, one per vertex.
#[derive(Debug, Clone, Default)]
pub struct TangentSpace {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub bitangents: Vec<Vec3>,
}

/// Cell rectangle left out of an index buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoleRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl HoleRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    fn overlaps(&self, x: u32, y: u32, w: u32, h: u32) -> bool {
        self.w > 0
            && self.h > 0
            && x < self.x + self.w
            && self.x < x + w
            && y < self.y + self.h
            && self.y < y + h
    }
}

/// Triangulates a `w * h` cell grid with `(w + 1)` vertices per row, leaving
/// out the cells of `hole`.
///
/// With `stitched` set the 2x2 blocks on the outer border are fanned around
/// their centre vertex and the odd vertices on the outer edge are skipped, so
/// the border matches a grid of half the resolution. Grids with odd sides
/// cannot be stitched and are tiled plainly.
pub fn grid_indices(w: u32, h: u32, hole: HoleRect, stitched: bool) -> Vec<u32> {
    let stride = w + 1;
    let index = |x: u32, y: u32| y * stride + x;
    let mut out = Vec::with_capacity((w * h * 6) as usize);

    let quad = |out: &mut Vec<u32>, x: u32, y: u32| {
        if hole.contains(x, y) {
            return;
        }
        let i0 = index(x, y);
        let i1 = i0 + 1;
        let i2 = index(x, y + 1);
        let i3 = i2 + 1;
        out.extend_from_slice(&[i0, i2, i1, i1, i2, i3]);
    };

    let can_stitch = stitched && w >= 2 && h >= 2 && w % 2 == 0 && h % 2 == 0;
    if !can_stitch {
        for y in 0..h {
            for x in 0..w {
                quad(&mut out, x, y);
            }
        }
        return out;
    }

    for by in (0..h).step_by(2) {
        for bx in (0..w).step_by(2) {
            let border = bx == 0 || by == 0 || bx + 2 == w || by + 2 == h;
            if border && !hole.overlaps(bx, by, 2, 2) {
                border_fan(&mut out, index, bx, by, w, h);
            } else {
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    quad(&mut out, bx + dx, by + dy);
                }
            }
        }
    }
    out
}

fn border_fan(
    out: &mut Vec<u32>,
    index: impl Fn(u32, u32) -> u32,
    bx: u32,
    by: u32,
    w: u32,
    h: u32,
) {
    let centre = index(bx + 1, by + 1);
    // Perimeter of the block, corners at even positions.
    let ring = [
        (bx, by, false),
        (bx + 1, by, by == 0),
        (bx + 2, by, false),
        (bx + 2, by + 1, bx + 2 == w),
        (bx + 2, by + 2, false),
        (bx + 1, by + 2, by + 2 == h),
        (bx, by + 2, false),
        (bx, by + 1, bx == 0),
    ];
    let points: Vec<u32> = ring
        .iter()
        .filter(|(_, _, skip)| !skip)
        .map(|&(x, y, _)| index(x, y))
        .collect();

    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        out.extend_from_slice(&[centre, b, a]);
    }
}

/// Texture coordinates spanning `[0, scale]` across the grid.
pub fn heightfield_uvs(width: u32, height: u32, scale: f32) -> Vec<Vec2> {
    let dx = if width > 1 { scale / (width - 1) as f32 } else { 0.0 };
    let dy = if height > 1 { scale / (height - 1) as f32 } else { 0.0 };
    (0..height)
        .flat_map(|y| (0..width).map(move |x| Vec2::new(x as f32 * dx, y as f32 * dy)))
        .collect()
}

/// Derives per-vertex tangent frames from central differences. The tangent
/// follows +x, the bitangent +z, samples on the edge are clamped.
pub fn tangent_space(positions: Vec<Vec3>, width: u32, height: u32) -> TangentSpace {
    let (w, h) = (width as usize, height as usize);
    if positions.len() != w * h || w == 0 || h == 0 {
        return TangentSpace {
            positions,
            ..Default::default()
        };
    }

    let frames: Vec<(Vec3, Vec3, Vec3)> = (0..w * h)
        .into_par_iter()
        .map(|i| {
            let (x, y) = (i % w, i / w);
            let at = |x: usize, y: usize| positions[y * w + x];

            let tangent =
                (at((x + 1).min(w - 1), y) - at(x.saturating_sub(1), y)).normalize_or_zero();
            let bitangent =
                (at(x, (y + 1).min(h - 1)) - at(x, y.saturating_sub(1))).normalize_or_zero();
            let normal = bitangent.cross(tangent).normalize_or_zero();
            (normal, tangent, bitangent)
        })
        .collect();

    let mut out = TangentSpace {
        normals: Vec::with_capacity(frames.len()),
        tangents: Vec::with_capacity(frames.len()),
        bitangents: Vec::with_capacity(frames.len()),
        positions,
    };
    for (n, t, b) in frames {
        out.normals.push(n);
        out.tangents.push(t);
        out.bitangents.push(b);
    }
    out
}

pub fn assemble_vertices(space: &TangentSpace, uvs: &[Vec2]) -> Vec<TerrainVertex> {
    space
        .positions
        .iter()
        .enumerate()
        .map(|(i, p)| TerrainVertex {
            position: p.to_array(),
            normal: space.normals.get(i).copied().unwrap_or(Vec3::Y).to_array(),
            tangent: space.tangents.get(i).copied().unwrap_or(Vec3::X).to_array(),
            bitangent: space.bitangents.get(i).copied().unwrap_or(Vec3::Z).to_array(),
            uv: uvs.get(i).copied().unwrap_or(Vec2::ZERO).to_array(),
        })
        .collect()
}

/// Flat `unitbase * unitbase` cell quad centred on the origin. Vertex fetch
/// rings displace and scale it in the vertex shader.
pub fn vertex_fetch_quad(unitbase: u32) -> Vec<TerrainVertex> {
    let half = (unitbase / 2) as f32;
    let side = unitbase + 1;
    let uvs = heightfield_uvs(side, side, 1.0);
    (0..side)
        .flat_map(|y| (0..side).map(move |x| (x, y)))
        .zip(uvs)
        .map(|((x, y), uv)| TerrainVertex {
            position: [x as f32 - half, 0.0, y as f32 - half],
            normal: Vec3::Y.to_array(),
            tangent: Vec3::X.to_array(),
            bitangent: Vec3::Z.to_array(),
            uv: uv.to_array(),
        })
        .collect()
}
