use bitflags::bitflags;
use crossbeam_channel::Sender;
use glam::Vec2;
use image::{DynamicImage, GrayImage};
use tracing::{debug, warn};

use super::error::{Error, Result};

bitflags! {
    /// Load flags handed to the heightmap source with every fetch.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct TextureFlags: u32 {
        /// Keep the decoded pixels around, height queries read them on the CPU.
        const KEEP_IMAGE = 0x1;
        /// Do not upload until the texture is first bound.
        const LAZY_UPLOAD = 0x2;
        /// Vertex shader sampling has no gradients, so mips are useless.
        const NO_MIPS = 0x4;
        /// Pad non power-of-two data instead of rescaling it.
        const NPOT_PAD = 0x8;
    }
}

impl TextureFlags {
    pub fn heightmap() -> Self {
        Self::KEEP_IMAGE | Self::LAZY_UPLOAD | Self::NO_MIPS | Self::NPOT_PAD
    }
}

/// Single channel heightmap with the extent of the texture it backs.
#[derive(Debug, Clone)]
pub struct HeightImage {
    pixels: GrayImage,
    texture_extent: [u32; 2],
}

impl HeightImage {
    /// `texture_extent` is the GPU texture size the pixels are padded or
    /// cropped into. Zero components fall back to the image size.
    pub fn new(pixels: GrayImage, texture_extent: [u32; 2]) -> Self {
        let (w, h) = pixels.dimensions();
        let texture_extent = [
            if texture_extent[0] == 0 { w } else { texture_extent[0] },
            if texture_extent[1] == 0 { h } else { texture_extent[1] },
        ];
        Self {
            pixels,
            texture_extent,
        }
    }

    pub fn from_dynamic(image: DynamicImage, texture_extent: [u32; 2]) -> Self {
        Self::new(image.to_luma8(), texture_extent)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels.get_pixel(x, y).0[0]
    }

    /// Reads a pixel with coordinates clamped to the image edge.
    pub fn pixel_clamped(&self, x: i64, y: i64) -> u8 {
        let x = x.clamp(0, self.width().saturating_sub(1) as i64) as u32;
        let y = y.clamp(0, self.height().saturating_sub(1) as i64) as u32;
        self.pixel(x, y)
    }

    pub fn texture_width(&self) -> u32 {
        self.texture_extent[0]
    }

    pub fn texture_height(&self) -> u32 {
        self.texture_extent[1]
    }

    /// Fraction of the texture actually covered by image data.
    pub fn padding_compensation(&self) -> Vec2 {
        Vec2::new(
            self.width().min(self.texture_width()) as f32 / self.texture_width() as f32,
            self.height().min(self.texture_height()) as f32 / self.texture_height() as f32,
        )
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Index of the map in the terrain description.
    pub map: usize,
    pub url: String,
    pub flags: TextureFlags,
    pub extent: [u32; 2],
}

#[derive(Debug)]
pub struct FetchResult {
    pub map: usize,
    pub image: Result<HeightImage>,
}

pub type FetchSender = Sender<FetchResult>;

/// Asynchronous heightmap loader. Implementations must eventually deliver
/// exactly one [`FetchResult`] per request through `done`.
pub trait HeightmapSource {
    fn fetch(&mut self, request: FetchRequest, done: FetchSender);
}

/// Decodes heightmaps from the filesystem on the rayon pool.
#[derive(Default)]
pub struct ImageFileSource;

impl HeightmapSource for ImageFileSource {
    fn fetch(&mut self, request: FetchRequest, done: FetchSender) {
        rayon::spawn(move || {
            let image = load_height_image(&request.url, request.extent);
            if let Err(err) = &image {
                warn!("failed to decode heightmap {}: {}", request.url, err);
            }
            if done
                .send(FetchResult {
                    map: request.map,
                    image,
                })
                .is_err()
            {
                debug!("heightmap {} arrived after its terrain was dropped", request.url);
            }
        });
    }
}

pub fn load_height_image(path: &str, texture_extent: [u32; 2]) -> Result<HeightImage> {
    let image = image::open(path).map_err(|e| Error::loading(format!("heightmap ({e})"), path))?;
    Ok(HeightImage::from_dynamic(image, texture_extent))
}
