//! Runtime tunables of a [`TerrainNode`](super::TerrainNode).
//!
//! Settings can be built in code or read from a JSON object where every
//! field is optional.
use serde::{Deserialize, Serialize};

use super::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainSettings {
    /// Displace a shared quad in the vertex shader instead of building CPU meshes.
    #[serde(default = "TerrainSettings::default_use_vertex_fetch")]
    pub use_vertex_fetch: bool,
    #[serde(default = "TerrainSettings::default_use_worker")]
    pub use_worker: bool, // Run tangent-space generation on a background thread.
    #[serde(default = "TerrainSettings::default_camera_timeout")]
    pub camera_timeout: u64, // Frames a camera may go unqueried before its rings are dropped.
    #[serde(default = "TerrainSettings::default_update_threshold")]
    pub update_threshold: f32, // Camera displacement (tiles) that triggers a ring update.
    #[serde(default = "TerrainSettings::default_no_mans_border")]
    pub no_mans_border: f32, // Border (tiles) where height queries answer `None`.
    #[serde(default = "TerrainSettings::default_max_fetch_attempts")]
    pub max_fetch_attempts: u32, // Heightmap fetch attempts before a map is given up on.
}

impl TerrainSettings {
    fn default_use_vertex_fetch() -> bool { true }
    fn default_use_worker() -> bool { true }
    fn default_camera_timeout() -> u64 { 1000 }
    fn default_update_threshold() -> f32 { 0.4 }
    fn default_no_mans_border() -> f32 { 0.1 }
    fn default_max_fetch_attempts() -> u32 { 3 }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Displacement threshold actually applied per frame. Updates are far
    /// cheaper with vertex fetch so the threshold shrinks accordingly.
    pub fn effective_update_threshold(&self) -> f32 {
        if self.use_vertex_fetch {
            self.update_threshold * 0.01
        } else {
            self.update_threshold
        }
    }
}

impl Default for TerrainSettings {
    fn default() -> Self {
        Self {
            use_vertex_fetch: Self::default_use_vertex_fetch(),
            use_worker: Self::default_use_worker(),
            camera_timeout: Self::default_camera_timeout(),
            update_threshold: Self::default_update_threshold(),
            no_mans_border: Self::default_no_mans_border(),
            max_fetch_attempts: Self::default_max_fetch_attempts(),
        }
    }
}
