//! Image operations used by the quality gate, encoder and augmentation:
//! grayscale conversion, cropping, rotation, brightness scaling, CLAHE and
//! sharpness measurement.

use crate::types::Rect;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Pixel, RgbImage};

/// Convert to 8-bit grayscale with BT.601 weights.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(frame.width(), frame.height());
    for (dst, src) in gray.pixels_mut().zip(frame.pixels()) {
        let [r, g, b] = src.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        *dst = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    gray
}

/// Crop `rect` out of `img`, clipped to its bounds.
pub fn crop<P>(img: &ImageBuffer<P, Vec<P::Subpixel>>, rect: Rect) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
{
    let r = rect.clamp_to(img.width(), img.height());
    imageops::crop_imm(img, r.x, r.y, r.width, r.height).to_image()
}

/// Largest centered square that fits in a `width` × `height` image.
pub fn center_square(width: u32, height: u32) -> Rect {
    let side = width.min(height);
    let x = (width / 2).saturating_sub(side / 2);
    let y = (height / 2).saturating_sub(side / 2);
    Rect::new(x, y, side, side)
}

/// Bilinear resize to `width` × `height`.
pub fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    imageops::resize(img, width, height, FilterType::Triangle)
}

pub fn flip_horizontal(img: &RgbImage) -> RgbImage {
    imageops::flip_horizontal(img)
}

/// Rotate `img` by `angle_deg` about its center, keeping the canvas size.
///
/// Positive angles rotate counter-clockwise as seen on screen. Pixels mapped
/// from outside the source are black.
pub fn rotate_about_center(img: &RgbImage, angle_deg: f32) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let cx = (w / 2) as f32;
    let cy = (h / 2) as f32;
    let theta = angle_deg.to_radians();
    let (sin, cos) = theta.sin_cos();

    let mut out = RgbImage::new(w, h);
    for oy in 0..h {
        for ox in 0..w {
            // Inverse map: destination pixel back into the source.
            let dx = ox as f32 - cx;
            let dy = oy as f32 - cy;
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;
            out.put_pixel(ox, oy, sample_bilinear(img, sx, sy));
        }
    }
    out
}

fn sample_bilinear(img: &RgbImage, sx: f32, sy: f32) -> image::Rgb<u8> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let fetch = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = img.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut px = [0u8; 3];
    for c in 0..3 {
        let val = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        px[c] = val.round().clamp(0.0, 255.0) as u8;
    }
    image::Rgb(px)
}

/// Multiply every channel by `alpha`, saturating to [0, 255].
pub fn scale_brightness(img: &RgbImage, alpha: f32) -> RgbImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        for c in p.0.iter_mut() {
            *c = (*c as f32 * alpha).abs().round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Mean intensity of a grayscale image, 0.0 when empty.
pub fn mean_intensity(gray: &GrayImage) -> f64 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n as f64
}

/// Variance of the 4-neighbour Laplacian, a sharpness measure.
///
/// Borders are reflected without repeating the edge pixel. Returns `None`
/// for images smaller than 3×3.
pub fn laplacian_variance(gray: &GrayImage) -> Option<f64> {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w < 3 || h < 3 {
        return None;
    }

    let reflect = |i: i64, n: i64| -> u32 {
        let r = if i < 0 {
            -i
        } else if i >= n {
            2 * n - i - 2
        } else {
            i
        };
        r as u32
    };
    let at = |x: i64, y: i64| -> f64 { gray.get_pixel(reflect(x, w), reflect(y, h))[0] as f64 };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = (w * h) as f64;
    let mean = sum / n;
    Some((sum_sq / n - mean * mean).max(0.0))
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// The image is split into a `grid` × `grid` array of tiles. Each tile's
/// histogram is clipped at `clip_limit * tile_pixels / 256` counts (at least
/// one). The excess is spread evenly over all bins and the remainder goes
/// one count at a time to every `256 / remainder`-th bin. Each tile maps a
/// level through `cdf * 255 / tile_pixels`, and pixels are remapped through
/// a bilinear blend of the four nearest tile lookups. A uniform tile
/// therefore maps to a small non-zero level rather than to 0.
pub fn clahe(gray: &mut GrayImage, grid: u32, clip_limit: f32) {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let tx = grid as usize;
    let ty = grid as usize;
    if w == 0 || h == 0 || tx == 0 {
        return;
    }
    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let data: &mut [u8] = gray;
    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;
            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[data[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let mut residual = (excess % 256) as usize;
            for bin in hist.iter_mut() {
                *bin += redist;
            }
            if residual > 0 {
                let step = (256 / residual).max(1);
                let mut i = 0;
                while i < 256 && residual > 0 {
                    hist[i] += 1;
                    i += step;
                    residual -= 1;
                }
            }

            let scale = 255.0 / tile_pixels as f32;
            let mut cdf = [0f32; 256];
            let mut sum = 0u32;
            for (level, &count) in hist.iter().enumerate() {
                sum += count;
                cdf[level] = (sum as f32 * scale).round().min(255.0);
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = data[y * w + x] as usize;

            let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (ty - 1) as f32);
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);
            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = cdfs[r0 * tx + c0][pixel];
            let tr = cdfs[r0 * tx + c1][pixel];
            let bl = cdfs[r1 * tx + c0][pixel];
            let br = cdfs[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            data[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
