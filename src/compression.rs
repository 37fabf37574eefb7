//! Compression Analyzer
//!
//! Re-encodes to baseline JPEG after flattening to 8-bit RGB (alpha and
//! palette are dropped on purpose) and reports before/after sizes.

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::transform::TransformError;

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub before_size_bytes: u64,
    pub after_size_bytes: u64,
    /// before / after, 2 decimal places
    pub ratio: f64,
    pub before_kb: f64,
    pub after_kb: f64,
}

impl CompressionStats {
    pub fn from_sizes(before: u64, after: u64) -> Result<Self, TransformError> {
        if after == 0 {
            return Err(TransformError::DegenerateOutput);
        }
        Ok(Self {
            before_size_bytes: before,
            after_size_bytes: after,
            ratio: round2(before as f64 / after as f64),
            before_kb: round2(before as f64 / 1024.0),
            after_kb: round2(after as f64 / 1024.0),
        })
    }
}

/// Quality must already be within 1..=100.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    {
        let quality = quality.clamp(MIN_QUALITY, MAX_QUALITY);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode_image(&rgb)
            .map_err(|e| TransformError::Encode(e.to_string()))?;
    }
    Ok(out)
}

/// Encode and measure against the size of the original bytes.
pub fn compress(
    img: &DynamicImage,
    source_len: usize,
    quality: u8,
) -> Result<(Vec<u8>, CompressionStats), TransformError> {
    let encoded = encode_jpeg(img, quality)?;
    let stats = CompressionStats::from_sizes(source_len as u64, encoded.len() as u64)?;
    Ok((encoded, stats))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn noisy(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104_729)) as u8;
            Rgba([v, v.wrapping_mul(3), x as u8, 128])
        }))
    }

    #[test]
    fn test_ratio_rounding() {
        let stats = CompressionStats::from_sizes(1000, 300).unwrap();
        assert_eq!(stats.ratio, 3.33);
        assert_eq!(stats.before_kb, 0.98);
        assert_eq!(stats.after_kb, 0.29);
    }

    #[test]
    fn test_zero_output_is_degenerate() {
        assert!(matches!(
            CompressionStats::from_sizes(10, 0),
            Err(TransformError::DegenerateOutput)
        ));
    }

    #[test]
    fn test_output_is_jpeg_and_flattened() {
        let img = noisy(32, 32);
        let (bytes, stats) = compress(&img, 5000, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(stats.after_size_bytes, bytes.len() as u64);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(!decoded.color().has_alpha());
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_higher_quality_not_smaller() {
        let img = noisy(64, 64);
        let high = encode_jpeg(&img, 100).unwrap();
        let mid = encode_jpeg(&img, 50).unwrap();
        assert!(high.len() as f64 / mid.len() as f64 >= 1.0);
    }

    #[test]
    fn test_encoding_deterministic() {
        let img = noisy(40, 24);
        assert_eq!(encode_jpeg(&img, 80).unwrap(), encode_jpeg(&img, 80).unwrap());
    }
}
