//! Cover and promotional asset normalization.

use crate::config::CoverConfig;
use crate::error::{AppError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// How the delivery layer should render an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Static image.
    Image,
    /// Looping silent background clip.
    Video,
}

/// Size class an image is normalized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetProfile {
    /// Book cover.
    Cover,
    /// Full-width hero background.
    Hero,
}

/// An asset ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAsset {
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// Image or video.
    pub media_type: MediaType,
    /// MIME type of `bytes`.
    pub content_type: String,
    /// File extension matching `content_type`.
    pub extension: &'static str,
    /// Pixel dimensions, for images.
    pub dimensions: Option<(u32, u32)>,
}

/// Re-encodes images to bounded JPEGs and passes video through.
#[derive(Debug, Clone)]
pub struct AssetNormalizer {
    cover_max_edge: u32,
    hero_max_edge: u32,
    quality: u8,
}

impl Default for AssetNormalizer {
    fn default() -> Self {
        Self::new(&CoverConfig::default())
    }
}

impl AssetNormalizer {
    /// Create a normalizer from configuration.
    pub fn new(config: &CoverConfig) -> Self {
        Self {
            cover_max_edge: config.cover_max_edge.max(1),
            hero_max_edge: config.hero_max_edge.max(1),
            quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    /// Longest edge allowed for a profile.
    pub fn max_edge(&self, profile: AssetProfile) -> u32 {
        match profile {
            AssetProfile::Cover => self.cover_max_edge,
            AssetProfile::Hero => self.hero_max_edge,
        }
    }

    /// Normalize raw upload bytes for the given profile.
    pub fn normalize(&self, data: &[u8], profile: AssetProfile) -> Result<NormalizedAsset> {
        if data.is_empty() {
            return Err(AppError::AssetNormalization("Empty asset".into()));
        }

        if let Some((content_type, extension)) = sniff_video(data) {
            return Ok(NormalizedAsset {
                bytes: data.to_vec(),
                media_type: MediaType::Video,
                content_type: content_type.to_string(),
                extension,
                dimensions: None,
            });
        }

        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| AppError::AssetNormalization(format!("Failed to read image: {}", e)))?
            .decode()
            .map_err(|e| {
                AppError::AssetNormalization(format!("Unsupported or corrupt image: {}", e))
            })?;

        let bounded = self.bound(img, self.max_edge(profile));
        let (width, height) = (bounded.width(), bounded.height());

        // JPEG has no alpha channel
        let rgb = bounded.to_rgb8();
        let mut jpeg_data = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg_data, self.quality)
            .encode_image(&rgb)
            .map_err(|e| AppError::AssetNormalization(format!("Failed to encode JPEG: {}", e)))?;

        Ok(NormalizedAsset {
            bytes: jpeg_data,
            media_type: MediaType::Image,
            content_type: "image/jpeg".to_string(),
            extension: "jpg",
            dimensions: Some((width, height)),
        })
    }

    /// Shrink so the longest edge fits, keeping aspect ratio. Never enlarges.
    fn bound(&self, img: DynamicImage, max_edge: u32) -> DynamicImage {
        if img.width().max(img.height()) <= max_edge {
            return img;
        }
        img.resize(max_edge, max_edge, image::imageops::FilterType::Lanczos3)
    }
}

/// Recognize video containers by magic bytes.
fn sniff_video(data: &[u8]) -> Option<(&'static str, &'static str)> {
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        let brand = &data[8..12];
        if brand == b"qt  " {
            return Some(("video/quicktime", "mov"));
        }
        // HEIF/AVIF stills share the ISO-BMFF box layout
        if matches!(brand, b"heic" | b"heix" | b"mif1" | b"avif") {
            return None;
        }
        return Some(("video/mp4", "mp4"));
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(("video/webm", "webm"));
    }
    None
}
