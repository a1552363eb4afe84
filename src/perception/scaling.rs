/// Patch-aligned resize and the scale factors that map model-space
/// coordinates back to source-image pixels.
use base64::Engine as _;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::errors::{LocatorError, LocatorResult};

/// Pixel mapping between the image the model saw and the original.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    pub original_width: u32,
    pub original_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    /// `original_width / resized_width`
    pub width_scale: f64,
    /// `original_height / resized_height`
    pub height_scale: f64,
}

impl ScaleFactors {
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            original_width: width,
            original_height: height,
            resized_width: width,
            resized_height: height,
            width_scale: 1.0,
            height_scale: 1.0,
        }
    }

    /// Compute the target size for `width × height` under `max_pixels`,
    /// flooring each side to a multiple of `patch` (at least one patch).
    pub fn compute(width: u32, height: u32, max_pixels: u64, patch: u32) -> LocatorResult<Self> {
        if width == 0 || height == 0 {
            return Err(LocatorError::Image(format!("empty image {width}x{height}")));
        }
        let patch = patch.max(1);
        let pixels = u64::from(width) * u64::from(height);
        if pixels <= max_pixels {
            return Ok(Self::identity(width, height));
        }

        let scale = (max_pixels as f64 / pixels as f64).sqrt();
        let align = |side: u32| -> u32 {
            let scaled = (side as f64 * scale).floor() as u32;
            ((scaled / patch) * patch).max(patch)
        };
        let resized_width = align(width);
        let resized_height = align(height);

        Ok(Self {
            original_width: width,
            original_height: height,
            resized_width,
            resized_height,
            width_scale: width as f64 / resized_width as f64,
            height_scale: height as f64 / resized_height as f64,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.original_width == self.resized_width && self.original_height == self.resized_height
    }

    /// Model-space point → original pixels (rounded, unclamped).
    pub fn to_original(&self, x: f64, y: f64) -> (i64, i64) {
        (
            (x * self.width_scale).round() as i64,
            (y * self.height_scale).round() as i64,
        )
    }

    /// Original pixels → model-space point.
    pub fn to_resized(&self, x: f64, y: f64) -> (f64, f64) {
        (x / self.width_scale, y / self.height_scale)
    }
}

/// Resize `img` to fit the pixel budget. Returns the image unchanged when no
/// resize is needed.
pub fn smart_resize(
    img: DynamicImage,
    max_pixels: u64,
    patch: u32,
) -> LocatorResult<(DynamicImage, ScaleFactors)> {
    let factors = ScaleFactors::compute(img.width(), img.height(), max_pixels, patch)?;
    if factors.is_identity() {
        return Ok((img, factors));
    }

    tracing::debug!(
        from_w = factors.original_width,
        from_h = factors.original_height,
        to_w = factors.resized_width,
        to_h = factors.resized_height,
        "resizing screenshot for model"
    );
    let resized = img.resize_exact(
        factors.resized_width,
        factors.resized_height,
        image::imageops::FilterType::Lanczos3,
    );
    Ok((resized, factors))
}

/// Model-ready image: PNG data URL plus its scale factors. Built once per
/// request and shared by every call made for it.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub image_url: String,
    pub scale: ScaleFactors,
}

impl ImagePayload {
    pub fn prepare(img: &DynamicImage, max_pixels: u64, patch: u32) -> LocatorResult<Self> {
        let (resized, scale) = smart_resize(img.clone(), max_pixels, patch)?;

        let mut png_bytes = Vec::new();
        resized
            .write_to(
                &mut std::io::Cursor::new(&mut png_bytes),
                image::ImageFormat::Png,
            )
            .map_err(|e| LocatorError::Image(format!("PNG encode: {e}")))?;

        let b64 = base64::engine::general_purpose::STANDARD.encode(&png_bytes);
        Ok(Self {
            image_url: format!("data:image/png;base64,{b64}"),
            scale,
        })
    }
}
