use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::frame::{GrayFrame, PixelFormat, RawFrame};

/// Convert a raw frame to the camera's normalized intensity frame.
///
/// Validates the byte length, converts to luma and resizes to
/// `width` x `height` when the source delivers a different size.
pub fn normalize_frame(
    raw: &RawFrame,
    camera_id: &str,
    width: u32,
    height: u32,
) -> Result<GrayFrame> {
    check_len(raw)?;
    let luma = to_luma(&raw.data, raw.width, raw.height, raw.format)?;
    let pixels = if raw.width == width && raw.height == height {
        luma
    } else {
        let image = GrayImage::from_raw(raw.width, raw.height, luma)
            .ok_or_else(|| anyhow!("luma plane does not fit {}x{}", raw.width, raw.height))?;
        imageops::resize(&image, width, height, FilterType::Triangle).into_raw()
    };
    GrayFrame::new(camera_id, width, height, pixels, raw.captured_at_ms)
}

/// Colour rendition of a raw frame at the requested size (the `original` artifact).
pub fn to_rgb_image(raw: &RawFrame, width: u32, height: u32) -> Result<RgbImage> {
    check_len(raw)?;
    let rgb = match raw.format {
        PixelFormat::Rgb24 => raw.data.clone(),
        PixelFormat::Bgr24 => raw
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::Gray8 => raw.data.iter().flat_map(|&y| [y, y, y]).collect(),
        PixelFormat::Nv12 => nv12_to_rgb(&raw.data, raw.width, raw.height)?,
    };
    let image = RgbImage::from_raw(raw.width, raw.height, rgb)
        .ok_or_else(|| anyhow!("RGB plane does not fit {}x{}", raw.width, raw.height))?;
    if raw.width == width && raw.height == height {
        return Ok(image);
    }
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}

fn check_len(raw: &RawFrame) -> Result<()> {
    let expected = raw
        .format
        .expected_len(raw.width, raw.height)
        .ok_or_else(|| anyhow!("{:?} frame dimensions overflow", raw.format))?;
    if raw.width == 0 || raw.height == 0 {
        return Err(anyhow!("{:?} frame has zero dimension", raw.format));
    }
    // Chroma is subsampled 2x2; odd sizes have no well-defined UV plane.
    if raw.format == PixelFormat::Nv12 && (raw.width % 2 != 0 || raw.height % 2 != 0) {
        return Err(anyhow!(
            "Nv12 frame needs even dimensions, got {}x{}",
            raw.width,
            raw.height
        ));
    }
    if raw.data.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            raw.format,
            expected,
            raw.data.len()
        ));
    }
    Ok(())
}

fn to_luma(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Gray8 => Ok(pixels.to_vec()),
        PixelFormat::Rgb24 => Ok(pixels
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect()),
        PixelFormat::Bgr24 => Ok(pixels
            .chunks_exact(3)
            .map(|px| luma(px[2], px[1], px[0]))
            .collect()),
        PixelFormat::Nv12 => {
            let y_plane = (width as usize)
                .checked_mul(height as usize)
                .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
            Ok(pixels[..y_plane].to_vec())
        }
    }
}

// BT.601
fn luma(r: u8, g: u8, b: u8) -> u8 {
    clamp_to_u8(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(y + 1.402 * v);
            rgb[offset + 1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
            rgb[offset + 2] = clamp_to_u8(y + 1.772 * u);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> RawFrame {
        RawFrame::new(width, height, format, data, 42)
    }

    #[test]
    fn rgb_and_bgr_agree_on_luma() -> Result<()> {
        let rgb = raw(1, 1, PixelFormat::Rgb24, vec![200, 100, 50]);
        let bgr = raw(1, 1, PixelFormat::Bgr24, vec![50, 100, 200]);
        let a = normalize_frame(&rgb, "cam-1", 1, 1)?;
        let b = normalize_frame(&bgr, "cam-1", 1, 1)?;
        assert_eq!(a.pixels(), b.pixels());
        assert_eq!(a.pixels()[0], 124);
        assert_eq!(a.timestamp_ms(), 42);
        Ok(())
    }

    #[test]
    fn nv12_uses_luma_plane() -> Result<()> {
        let nv12 = [vec![10, 20, 30, 40], vec![128, 128]].concat();
        let frame = normalize_frame(&raw(2, 2, PixelFormat::Nv12, nv12), "cam-1", 2, 2)?;
        assert_eq!(frame.pixels(), &[10, 20, 30, 40]);
        Ok(())
    }

    #[test]
    fn nv12_neutral_chroma_renders_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let image = to_rgb_image(&raw(2, 2, PixelFormat::Nv12, nv12), 2, 2)?;
        assert_eq!(image.into_raw(), vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn nv12_with_odd_dimensions_is_rejected() {
        let odd = raw(3, 3, PixelFormat::Nv12, vec![128; 13]);
        assert!(normalize_frame(&odd, "cam-1", 3, 3).is_err());
        assert!(to_rgb_image(&odd, 3, 3).is_err());
        let odd_height = raw(4, 3, PixelFormat::Nv12, vec![128; 18]);
        assert!(to_rgb_image(&odd_height, 4, 3).is_err());
    }

    #[test]
    fn frames_are_resized_to_camera_dimensions() -> Result<()> {
        let frame = normalize_frame(&raw(8, 6, PixelFormat::Gray8, vec![77; 48]), "cam-1", 4, 3)?;
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert!(frame.pixels().iter().all(|&p| p == 77));
        Ok(())
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let short = raw(4, 4, PixelFormat::Rgb24, vec![0; 47]);
        assert!(normalize_frame(&short, "cam-1", 4, 4).is_err());
        assert!(to_rgb_image(&short, 4, 4).is_err());
        let empty = raw(0, 4, PixelFormat::Gray8, vec![]);
        assert!(normalize_frame(&empty, "cam-1", 4, 4).is_err());
    }
}
