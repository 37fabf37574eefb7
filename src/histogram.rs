//! Histogram Visualization
//!
//! Per-channel frequency over 256 intensity bins, drawn as overlaid
//! semi-transparent bar series on a white chart.

use image::{Rgb, RgbImage, RgbaImage};
use serde::Serialize;

pub const BINS: usize = 256;

const CHART_WIDTH: u32 = 600;
const CHART_HEIGHT: u32 = 400;
const MARGIN_LEFT: u32 = 44;
const MARGIN_TOP: u32 = 24;
const PLOT_WIDTH: u32 = 512;
const PLOT_HEIGHT: u32 = 336;
const SERIES_ALPHA: f64 = 0.5;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const SERIES_COLORS: [Rgb<u8>; 3] = [Rgb([255, 0, 0]), Rgb([0, 128, 0]), Rgb([0, 0, 255])];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub red: Vec<u64>,
    pub green: Vec<u64>,
    pub blue: Vec<u64>,
}

impl Histogram {
    /// Count intensities. Alpha is ignored, matching an RGB flattening of the source.
    pub fn compute(img: &RgbaImage) -> Self {
        let mut channels = [[0u64; BINS]; 3];
        for px in img.pixels() {
            for (c, bins) in channels.iter_mut().enumerate() {
                bins[usize::from(px.0[c])] += 1;
            }
        }
        let [red, green, blue] = channels;
        Self {
            red: red.to_vec(),
            green: green.to_vec(),
            blue: blue.to_vec(),
        }
    }

    pub fn series(&self) -> [&[u64]; 3] {
        [&self.red, &self.green, &self.blue]
    }

    pub fn peak(&self) -> u64 {
        self.series()
            .iter()
            .flat_map(|s| s.iter().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn render(&self) -> RgbImage {
        let mut chart = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, BACKGROUND);
        let peak = self.peak();
        let bar_width = PLOT_WIDTH / BINS as u32;
        let baseline = MARGIN_TOP + PLOT_HEIGHT;

        if peak > 0 {
            for (series, color) in self.series().iter().zip(SERIES_COLORS) {
                for (bin, &count) in series.iter().enumerate() {
                    let bar = (count as f64 / peak as f64 * f64::from(PLOT_HEIGHT)).round() as u32;
                    let x0 = MARGIN_LEFT + bin as u32 * bar_width;
                    for x in x0..x0 + bar_width {
                        for y in baseline - bar..baseline {
                            blend(chart.get_pixel_mut(x, y), color, SERIES_ALPHA);
                        }
                    }
                }
            }
        }

        for y in MARGIN_TOP..=baseline {
            chart.put_pixel(MARGIN_LEFT - 1, y, AXIS);
        }
        for x in MARGIN_LEFT - 1..MARGIN_LEFT + PLOT_WIDTH {
            chart.put_pixel(x, baseline, AXIS);
        }
        chart
    }
}

fn blend(dst: &mut Rgb<u8>, color: Rgb<u8>, alpha: f64) {
    for c in 0..3 {
        let mixed = f64::from(dst.0[c]) * (1.0 - alpha) + f64::from(color.0[c]) * alpha;
        dst.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
    }
}
