//! Pixel Filters
//!
//! Pure functions over RGBA buffers. Every loop walks a finite pixel grid
//! (source or output), never anything unbounded. Alpha is carried through
//! untouched by the tone and kernel filters.

use image::{imageops, Rgba, RgbaImage};

/// Fill for canvas area exposed by rotation
pub const ROTATION_FILL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// 3x3 kernel with its divisor
#[derive(Debug, Clone, Copy)]
pub struct Kernel {
    pub weights: [i32; 9],
    pub scale: i32,
}

/// Edge enhancement
pub const SHARPEN: Kernel = Kernel {
    weights: [-2, -2, -2, -2, 32, -2, -2, -2, -2],
    scale: 16,
};

/// Low-pass
pub const SMOOTH: Kernel = Kernel {
    weights: [1, 1, 1, 1, 5, 1, 1, 1, 1],
    scale: 13,
};

/// Rotate clockwise by `angle` degrees, expanding the canvas to hold every
/// source pixel. Right angles are exact; other angles sample bilinearly.
pub fn rotate_clockwise(img: &RgbaImage, angle: i64) -> RgbaImage {
    match angle.rem_euclid(360) {
        0 => img.clone(),
        90 => imageops::rotate90(img),
        180 => imageops::rotate180(img),
        270 => imageops::rotate270(img),
        other => rotate_expand(img, other as f64),
    }
}

/// Canvas size after rotating a `width` x `height` image by `angle` degrees.
pub fn rotated_extent(width: u32, height: u32, angle: i64) -> (u32, u32) {
    match angle.rem_euclid(360) {
        0 | 180 => (width, height),
        90 | 270 => (height, width),
        other => {
            let (sin, cos) = (other as f64).to_radians().sin_cos();
            let (wf, hf) = (f64::from(width), f64::from(height));
            (
                extent(wf * cos.abs() + hf * sin.abs()),
                extent(wf * sin.abs() + hf * cos.abs()),
            )
        }
    }
}

fn rotate_expand(img: &RgbaImage, degrees: f64) -> RgbaImage {
    let (w, h) = img.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (wf, hf) = (f64::from(w), f64::from(h));

    let (out_w, out_h) = rotated_extent(w, h, degrees as i64);
    let (cx, cy) = (wf / 2.0, hf / 2.0);
    let (ocx, ocy) = (f64::from(out_w) / 2.0, f64::from(out_h) / 2.0);

    let mut out = RgbaImage::from_pixel(out_w, out_h, ROTATION_FILL);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        let dx = f64::from(ox) + 0.5 - ocx;
        let dy = f64::from(oy) + 0.5 - ocy;
        // inverse of the clockwise rotation (y grows downward)
        let sx = dx * cos + dy * sin + cx;
        let sy = -dx * sin + dy * cos + cy;
        if let Some(sample) = sample_bilinear(img, sx - 0.5, sy - 0.5) {
            *px = sample;
        }
    }
    out
}

fn extent(v: f64) -> u32 {
    // absorb float noise like 99.99999999 vs 100
    (v - 1e-6).ceil().max(1.0) as u32
}

fn sample_bilinear(img: &RgbaImage, fx: f64, fy: f64) -> Option<Rgba<u8>> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let (max_x, max_y) = (f64::from(w) - 1.0, f64::from(h) - 1.0);
    if fx < -0.5 || fy < -0.5 || fx > max_x + 0.5 || fy > max_y + 0.5 {
        return None;
    }

    let x = fx.clamp(0.0, max_x);
    let y = fy.clamp(0.0, max_y);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (tx, ty) = (x - f64::from(x0), y - f64::from(y0));

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = f64::from(p00[c]) * (1.0 - tx) + f64::from(p10[c]) * tx;
        let bottom = f64::from(p01[c]) * (1.0 - tx) + f64::from(p11[c]) * tx;
        out[c] = clamp_u8(top * (1.0 - ty) + bottom * ty);
    }
    Some(Rgba(out))
}

/// Scale every color channel by `factor`.
pub fn brightness(img: &RgbaImage, factor: f64) -> RgbaImage {
    map_color(img, |c| clamp_u8(f64::from(c) * factor))
}

/// Scale each channel's distance from the image's mean luminance.
pub fn contrast(img: &RgbaImage, factor: f64) -> RgbaImage {
    let pivot = mean_luminance(img).round();
    map_color(img, |c| clamp_u8(pivot + factor * (f64::from(c) - pivot)))
}

/// ITU-R 601 luma averaged over every pixel. 0 for an empty image.
pub fn mean_luminance(img: &RgbaImage) -> f64 {
    let count = u64::from(img.width()) * u64::from(img.height());
    if count == 0 {
        return 0.0;
    }
    let total: u64 = img
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            (299 * u64::from(r) + 587 * u64::from(g) + 114 * u64::from(b)) / 1000
        })
        .sum();
    total as f64 / count as f64
}

/// 3x3 convolution with clamp-to-edge sampling.
pub fn convolve3x3(img: &RgbaImage, kernel: &Kernel) -> RgbaImage {
    let (w, h) = img.dimensions();
    let mut out = RgbaImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }

    let scale = f64::from(kernel.scale);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let mut sums = [0i32; 3];
        for (k, weight) in kernel.weights.iter().enumerate() {
            let nx = neighbor(x, k as i64 % 3 - 1, w);
            let ny = neighbor(y, k as i64 / 3 - 1, h);
            let sample = img.get_pixel(nx, ny).0;
            for c in 0..3 {
                sums[c] += weight * i32::from(sample[c]);
            }
        }
        let alpha = img.get_pixel(x, y).0[3];
        *px = Rgba([
            clamp_u8(f64::from(sums[0]) / scale),
            clamp_u8(f64::from(sums[1]) / scale),
            clamp_u8(f64::from(sums[2]) / scale),
            alpha,
        ]);
    }
    out
}

fn neighbor(pos: u32, offset: i64, len: u32) -> u32 {
    (i64::from(pos) + offset).clamp(0, i64::from(len) - 1) as u32
}

fn map_color(img: &RgbaImage, f: impl Fn(u8) -> u8) -> RgbaImage {
    let mut out = img.clone();
    for px in out.pixels_mut() {
        let [r, g, b, a] = px.0;
        *px = Rgba([f(r), f(g), f(b), a]);
    }
    out
}

fn clamp_u8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
