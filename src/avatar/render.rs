use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageOutputFormat, Rgba, RgbaImage};

use crate::{ProfileError, Result};

pub const JPEG_MIME_TYPE: &str = "image/jpeg";
/// Largest radius [`round`] accepts; 4096 keeps a render within 256 MiB.
pub const MAX_RADIUS: u32 = 4096;

/// Decode raw bytes in any format the `image` crate recognises.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(ProfileError::Validation("image data is empty".to_owned()));
    }
    Ok(image::load_from_memory(bytes)?)
}

/// Crop the largest square centered in `image`.
pub fn largest_centered_square(image: &DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    image.crop_imm(x, y, side, side)
}

/// Square crop scaled down so that its side does not exceed `max_side`.
/// Smaller images are left at their size.
pub fn bounded_square(image: &DynamicImage, max_side: u32) -> DynamicImage {
    let square = largest_centered_square(image);
    if square.width() > max_side {
        square.resize_exact(max_side, max_side, FilterType::Lanczos3)
    } else {
        square
    }
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok(bytes)
}

/// Render `image` into a `2 * radius` square with everything outside the
/// inscribed circle made transparent.
pub fn round(image: &DynamicImage, radius: u32) -> Result<RgbaImage> {
    if radius == 0 || radius > MAX_RADIUS {
        return Err(ProfileError::Validation(format!(
            "avatar radius must be within 1..={}, got {}",
            MAX_RADIUS, radius
        )));
    }
    let diameter = radius.checked_mul(2).ok_or_else(|| {
        ProfileError::Validation(format!("avatar radius {} overflows", radius))
    })?;
    let mut canvas = largest_centered_square(image)
        .resize_exact(diameter, diameter, FilterType::Triangle)
        .to_rgba8();

    let r = radius as f32;
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - r;
        let dy = y as f32 + 0.5 - r;
        let distance = (dx * dx + dy * dy).sqrt();
        // one pixel of antialiasing along the rim
        let coverage = (r - distance + 0.5).clamp(0.0, 1.0);
        let Rgba([red, green, blue, alpha]) = *pixel;
        *pixel = Rgba([red, green, blue, (alpha as f32 * coverage) as u8]);
    }
    Ok(canvas)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut bytes, ImageOutputFormat::Png)?;
    Ok(bytes.into_inner())
}
