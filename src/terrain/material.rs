use bitflags::bitflags;
use glam::{Vec2, Vec3, Vec4};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::images::HeightImage;
use super::json::{CullFaceMode, PassStateEntry};

bitflags! {
    /// Behaviour flags passed to material resolution.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct MaterialFlags: u32 {
        const ENABLE_VERTEX_FETCH = 0x1;
    }
}

pub const VERTEX_FETCH_DEFINE: &str = "ENABLE_TERRAIN_VERTEX_FETCH";

#[derive(Clone, Debug)]
pub enum ShaderConstant {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    /// Texture referenced by path, resolved by the renderer.
    Texture(String),
    Heightmap(Arc<HeightImage>),
    Raw(Value),
}

impl From<&Value> for ShaderConstant {
    fn from(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(|f| ShaderConstant::Float(f as f32))
                .unwrap_or_else(|| ShaderConstant::Raw(value.clone())),
            Value::String(s) => ShaderConstant::Texture(s.clone()),
            Value::Array(items) => {
                let floats: Option<Vec<f32>> =
                    items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
                match floats.as_deref() {
                    Some([x]) => ShaderConstant::Float(*x),
                    Some([x, y]) => ShaderConstant::Vec2(Vec2::new(*x, *y)),
                    Some([x, y, z]) => ShaderConstant::Vec3(Vec3::new(*x, *y, *z)),
                    Some([x, y, z, w]) => ShaderConstant::Vec4(Vec4::new(*x, *y, *z, *w)),
                    _ => ShaderConstant::Raw(value.clone()),
                }
            }
            _ => ShaderConstant::Raw(value.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassState {
    pub cull_face: Option<bool>,
    pub cull_face_mode: Option<CullFaceMode>,
}

impl PassState {
    /// Back-face culling is on unless the description states otherwise.
    pub fn from_entry(entry: Option<&PassStateEntry>) -> Self {
        match entry {
            Some(s) if s.cull_face.is_some() || s.cull_face_mode.is_some() => Self {
                cull_face: s.cull_face,
                cull_face_mode: s.cull_face_mode,
            },
            _ => Self::default(),
        }
    }
}

impl Default for PassState {
    fn default() -> Self {
        Self {
            cull_face: Some(true),
            cull_face_mode: Some(CullFaceMode::Back),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pass {
    pub effect: String,
    pub defines: BTreeSet<String>,
    pub constants: BTreeMap<String, ShaderConstant>,
    /// Render state, shared between clones of the same material.
    pub state: Arc<PassState>,
}

impl Pass {
    pub fn set(&mut self, name: &str, value: ShaderConstant) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ShaderConstant> {
        self.constants.get(name)
    }
}

#[derive(Clone, Debug)]
pub struct Material {
    passes: Vec<Pass>,
}

impl Material {
    pub fn new(passes: Vec<Pass>) -> Self {
        Self { passes }
    }

    /// Unlit single color material used when a LOD has no material.
    pub fn flat_color(color: Vec4) -> Self {
        let mut constants = BTreeMap::new();
        constants.insert("color".to_string(), ShaderConstant::Vec4(color));
        Self::new(vec![Pass {
            effect: "simple_color".to_string(),
            defines: BTreeSet::new(),
            constants,
            state: Arc::new(PassState::default()),
        }])
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    /// Sets a constant on every pass.
    pub fn set(&mut self, name: &str, value: ShaderConstant) {
        for pass in &mut self.passes {
            pass.set(name, value.clone());
        }
    }
}

/// Joins a relative resource path onto a root directory or URL.
pub fn join_url(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), path)
    }
}

/// Rewrites `./`-relative strings to paths under `url_root`, descending into
/// nested objects and arrays.
pub fn fix_texture_paths(constants: &mut Map<String, Value>, url_root: &str) {
    for value in constants.values_mut() {
        fix_value(value, url_root);
    }
}

fn fix_value(value: &mut Value, url_root: &str) {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix("./") {
                *s = join_url(url_root, rest);
            }
        }
        Value::Object(map) => fix_texture_paths(map, url_root),
        Value::Array(items) => {
            for item in items {
                fix_value(item, url_root);
            }
        }
        _ => {}
    }
}
