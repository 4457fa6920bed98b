use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::info;

use super::error::{Error, Result};

/// One heightmap declared for the terrain. `size` is measured in tiles, the
/// backing image carries `size * unitbase` texels per side (optionally plus
/// one for odd-sided heightmaps).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MapEntry {
    pub size: [u32; 2],
    #[serde(default)]
    pub img: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CullFaceMode {
    Back,
    Front,
    FrontAndBack,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PassStateEntry {
    #[serde(default)]
    pub cull_face: Option<bool>,
    #[serde(default)]
    pub cull_face_mode: Option<CullFaceMode>,
}

/// Material for one LOD, either declared in place or borrowed from another
/// LOD's entry.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MaterialEntry {
    Clone {
        clonefrom: usize,
    },
    Effect {
        effect: String,
        #[serde(default)]
        constants: Map<String, Value>,
        #[serde(default)]
        state: Option<PassStateEntry>,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TerrainDescription {
    pub size: [u32; 2],
    pub unitbase: u32,
    pub scale: [f32; 3],
    #[serde(default = "TerrainDescription::default_hscale")]
    pub base_hscale: f32,
    #[serde(default)]
    pub default_height: f32,
    #[serde(default)]
    pub url_root: Option<String>,
    #[serde(default)]
    pub maps: Vec<MapEntry>,
    #[serde(default)]
    pub materials: Vec<MaterialEntry>,
}

impl TerrainDescription {
    fn default_hscale() -> f32 {
        1.0 / 255.0
    }

    /// Parses and validates a description. Any violated constraint aborts
    /// the load.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut desc: TerrainDescription = serde_json::from_str(json)?;
        if desc.base_hscale == 0.0 {
            desc.base_hscale = Self::default_hscale();
        }
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.unitbase.is_power_of_two() || self.unitbase < 4 {
            return Err(Error::config(format!(
                "unitbase for terrain must be power of two >= 4, got {}",
                self.unitbase
            )));
        }
        if !self.size[0].is_power_of_two() {
            return Err(Error::config(format!(
                "terrain width must be power of two, got {}",
                self.size[0]
            )));
        }
        if !self.size[1].is_power_of_two() {
            return Err(Error::config(format!(
                "terrain height must be power of two, got {}",
                self.size[1]
            )));
        }
        if self.scale[0] <= 0.0 {
            return Err(Error::config("horizontal terrain scale must be positive"));
        }

        for map in &self.maps {
            let [mw, mh] = map.size;
            if mw == 0 || mh == 0 || mw > self.size[0] || mh > self.size[1] {
                return Err(Error::config(format!(
                    "map size {}x{} does not fit the {}x{} terrain",
                    mw, mh, self.size[0], self.size[1]
                )));
            }
            // u64 keeps the cross product exact for large terrains.
            if mw as u64 * self.size[1] as u64 != mh as u64 * self.size[0] as u64 {
                return Err(Error::config(format!(
                    "LOD images with different aspect ratios than the main terrain are not supported ({}x{})",
                    mw, mh
                )));
            }
        }

        for (lod, mat) in self.materials.iter().enumerate() {
            if let MaterialEntry::Clone { clonefrom } = mat {
                if *clonefrom >= self.materials.len() {
                    return Err(Error::config(format!(
                        "material for LOD {lod} clones missing entry {clonefrom}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.size[0]
    }

    pub fn height(&self) -> u32 {
        self.size[1]
    }

    /// `floor(log2(min(width, height))) + 1`
    pub fn lod_count(&self) -> u32 {
        self.size[0].min(self.size[1]).ilog2() + 1
    }

    /// Map size (in tiles) that exactly covers `lod`.
    pub fn lod_size(&self, lod: u32) -> [u32; 2] {
        [
            self.size[0].checked_shr(lod).unwrap_or(0),
            self.size[1].checked_shr(lod).unwrap_or(0),
        ]
    }
}

/// Reads a terrain description file. Relative image and material paths are
/// resolved against the directory holding the file.
pub fn load_description(path: impl AsRef<Path>) -> Result<TerrainDescription> {
    let path = path.as_ref();
    info!("Loading terrain description {}", path.display());

    let json_data = fs::read_to_string(path).map_err(|e| {
        Error::loading(path.display().to_string(), e.to_string())
    })?;
    let mut desc = TerrainDescription::from_json_str(&json_data)?;

    let root = path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    desc.url_root = Some(root);
    Ok(desc)
}
