//! Raw V4L2 buffer conversion to RGB frames.

use image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("odd frame width {0} for YUYV")]
    OddWidth(u32),
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 studio-swing coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let expected = (width * height * 2) as usize;
    check_len("YUYV", yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(chunk[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(chunk[2], u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Replicate an 8-bit grayscale buffer into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let g = gray[(y * width + x) as usize];
        image::Rgb([g, g, g])
    }))
}

/// Downscale 16-bit little-endian grayscale to 8 bits and replicate to RGB.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("Y16", buf, pixels * 2)?;
    let gray: Vec<u8> = buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect();
    grey_to_rgb(&gray, width, height)
}
