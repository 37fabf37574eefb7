//! Transform Engine - Bytes In, New Bytes Out
//!
//! Operators never see storage. The orchestrator reads the input artifact,
//! hands the bytes here, and writes whatever comes back as a new artifact.
//!
//! CRITICAL: `apply` always validates parameters first. No bypass.

use image::{ColorType, DynamicImage, ImageFormat, ImageReader, Limits, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

use crate::compression::{self, CompressionStats};
use crate::config::EngineConfig;
use crate::directory::ArtifactKind;
use crate::filters;
use crate::histogram::Histogram;
use crate::validation::{ValidationResult, Validator};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Region {width}x{height} at ({x}, {y}) exceeds {source_width}x{source_height}")]
    InvalidRegion {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
    },

    #[error("Cannot decode image: {0}")]
    Decode(String),

    #[error("Cannot encode image: {0}")]
    Encode(String),

    #[error("Compression produced an empty artifact")]
    DegenerateOutput,

    #[error("Output {width}x{height} needs {bytes} bytes, limit is {limit}")]
    OutputTooLarge {
        width: u32,
        height: u32,
        bytes: u64,
        limit: u64,
    },
}

/// One editing request's operator and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Rotate { angle: i64 },
    Crop { x: i64, y: i64, width: i64, height: i64 },
    Compress { quality: i64 },
    Brightness { factor: f64 },
    Contrast { factor: f64 },
    Sharpen,
    Smooth,
    Histogram,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Rotate { .. } => "rotate",
            Operation::Crop { .. } => "crop",
            Operation::Compress { .. } => "compress",
            Operation::Brightness { .. } => "brightness",
            Operation::Contrast { .. } => "contrast",
            Operation::Sharpen => "sharpen",
            Operation::Smooth => "smooth",
            Operation::Histogram => "histogram",
        }
    }

    /// What kind of artifact the operator produces
    pub fn output_kind(&self) -> ArtifactKind {
        match self {
            Operation::Histogram => ArtifactKind::Diagnostic,
            _ => ArtifactKind::Edit,
        }
    }
}

/// Operator output, ready to store.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
    pub kind: ArtifactKind,
    pub width: u32,
    pub height: u32,
    pub stats: Option<CompressionStats>,
}

/// Sniffed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub format: ImageFormat,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_dimension: u32,
    pub max_alloc: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self {
            max_dimension: config.max_image_dimension,
            max_alloc: config.max_decode_bytes,
        }
    }
}

pub struct TransformEngine {
    limits: DecodeLimits,
    validator: Validator,
}

impl TransformEngine {
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            limits,
            validator: Validator::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(DecodeLimits {
            max_dimension: config.max_image_dimension,
            max_alloc: config.max_decode_bytes,
        })
    }

    /// Parameter check. Pure; touches no storage.
    pub fn validate(&self, op: &Operation) -> Result<ValidationResult, TransformError> {
        let result = self.validator.validate(op);
        if !result.valid {
            return Err(TransformError::InvalidParameter(result.error_summary()));
        }
        Ok(result)
    }

    /// Run `op` against encoded `input`.
    pub fn apply(&self, op: &Operation, input: &[u8]) -> Result<Rendered, TransformError> {
        self.validate(op)?;
        let source = self.decode(input)?;

        match *op {
            Operation::Rotate { angle } => {
                let rotated = match angle.rem_euclid(360) {
                    0 => source,
                    90 => source.rotate90(),
                    180 => source.rotate180(),
                    270 => source.rotate270(),
                    _ => {
                        // exposed corners need alpha whatever the source had
                        let (w, h) =
                            filters::rotated_extent(source.width(), source.height(), angle);
                        self.check_output(w, h)?;
                        let rgba = filters::rotate_clockwise(&source.to_rgba8(), angle);
                        DynamicImage::ImageRgba8(rgba)
                    }
                };
                encode_png(rotated, op.output_kind())
            }
            Operation::Crop { x, y, width, height } => {
                let (x, y) = (to_u32(x)?, to_u32(y)?);
                let (width, height) = (to_u32(width)?, to_u32(height)?);
                check_region(&source, x, y, width, height)?;
                encode_png(source.crop_imm(x, y, width, height), op.output_kind())
            }
            Operation::Compress { quality } => {
                let quality = u8::try_from(quality).map_err(|_| {
                    TransformError::InvalidParameter(format!("quality {}", quality))
                })?;
                let (bytes, stats) = compression::compress(&source, input.len(), quality)?;
                Ok(Rendered {
                    bytes,
                    extension: "jpg",
                    kind: op.output_kind(),
                    width: source.width(),
                    height: source.height(),
                    stats: Some(stats),
                })
            }
            Operation::Brightness { factor } => {
                let out = filters::brightness(&source.to_rgba8(), factor);
                encode_png(restore(out, source.color()), op.output_kind())
            }
            Operation::Contrast { factor } => {
                let out = filters::contrast(&source.to_rgba8(), factor);
                encode_png(restore(out, source.color()), op.output_kind())
            }
            Operation::Sharpen => {
                let out = filters::convolve3x3(&source.to_rgba8(), &filters::SHARPEN);
                encode_png(restore(out, source.color()), op.output_kind())
            }
            Operation::Smooth => {
                let out = filters::convolve3x3(&source.to_rgba8(), &filters::SMOOTH);
                encode_png(restore(out, source.color()), op.output_kind())
            }
            Operation::Histogram => {
                let chart = Histogram::compute(&source.to_rgba8()).render();
                encode_png(DynamicImage::ImageRgb8(chart), op.output_kind())
            }
        }
    }

    /// Refuse canvases the allocation limit would not have let us decode.
    fn check_output(&self, width: u32, height: u32) -> Result<(), TransformError> {
        let bytes = u64::from(width) * u64::from(height) * 4;
        if bytes > self.limits.max_alloc {
            return Err(TransformError::OutputTooLarge {
                width,
                height,
                bytes,
                limit: self.limits.max_alloc,
            });
        }
        Ok(())
    }

    /// Decode under the configured size limits.
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, TransformError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| TransformError::Decode(e.to_string()))?;
        if reader.format().is_none() {
            return Err(TransformError::Decode("unrecognized image format".to_string()));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.limits.max_dimension);
        limits.max_image_height = Some(self.limits.max_dimension);
        limits.max_alloc = Some(self.limits.max_alloc);
        reader.limits(limits);

        reader
            .decode()
            .map_err(|e| TransformError::Decode(e.to_string()))
    }

    /// Identify and fully decode an upload; the stored extension comes from
    /// the detected format, never from the client's filename.
    pub fn sniff(&self, bytes: &[u8]) -> Result<Sniffed, TransformError> {
        let format =
            image::guess_format(bytes).map_err(|e| TransformError::Decode(e.to_string()))?;
        let decoded = self.decode(bytes)?;
        let extension = format
            .extensions_str()
            .first()
            .copied()
            .ok_or_else(|| TransformError::Decode(format!("{:?} has no extension", format)))?;
        Ok(Sniffed {
            format,
            extension,
            width: decoded.width(),
            height: decoded.height(),
        })
    }
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new(DecodeLimits::default())
    }
}

fn to_u32(v: i64) -> Result<u32, TransformError> {
    u32::try_from(v).map_err(|_| TransformError::InvalidParameter(format!("{} out of range", v)))
}

fn check_region(
    source: &DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<(), TransformError> {
    let (sw, sh) = (source.width(), source.height());
    let fits_x = x.checked_add(width).is_some_and(|end| end <= sw);
    let fits_y = y.checked_add(height).is_some_and(|end| end <= sh);
    if fits_x && fits_y {
        Ok(())
    } else {
        Err(TransformError::InvalidRegion {
            x,
            y,
            width,
            height,
            source_width: sw,
            source_height: sh,
        })
    }
}

/// Back to the source's channel layout. Tone and kernel filters work at
/// 8 bits per channel.
fn restore(rgba: RgbaImage, like: ColorType) -> DynamicImage {
    let img = DynamicImage::ImageRgba8(rgba);
    match like {
        ColorType::L8 | ColorType::L16 => DynamicImage::ImageLuma8(img.to_luma8()),
        ColorType::La8 | ColorType::La16 => DynamicImage::ImageLumaA8(img.to_luma_alpha8()),
        c if c.has_alpha() => img,
        _ => DynamicImage::ImageRgb8(img.to_rgb8()),
    }
}

fn encode_png(img: DynamicImage, kind: ArtifactKind) -> Result<Rendered, TransformError> {
    // PNG has no float samples
    let img = match img {
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(img.to_rgb16()),
        DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(img.to_rgba16()),
        other => other,
    };
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    Ok(Rendered {
        bytes: buf.into_inner(),
        extension: "png",
        kind,
        width: img.width(),
        height: img.height(),
        stats: None,
    })
}
