use crate::error::{Error, Result};

use image::{GrayImage, ImageFormat, Luma};
use log::debug;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::path::Path;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const ADVANCE: u32 = GLYPH_WIDTH + 1;
const LINE_HEIGHT: u32 = GLYPH_HEIGHT + 3;
const SCALE: u32 = 2;
const PADDING: u32 = 4;

const BACKGROUND: Luma<u8> = Luma([255]);
const INK: Luma<u8> = Luma([0]);

/// Map `value` from `[min, max]` onto `0..=255`. A flat range maps to 0.
fn normalize_to_u8(value: f32, min: f32, max: f32) -> u8 {
    let range = max - min;
    if range <= f32::EPSILON || !value.is_finite() {
        return 0;
    }
    (((value - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Grayscale image of a slice rotated 90° counterclockwise, so the first
/// array axis runs left to right and the second runs bottom to top.
pub fn slice_to_image(slice: &ArrayView2<'_, f32>) -> GrayImage {
    let (n0, n1) = slice.dim();
    let (min, max) = slice
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let pixels: Vec<u8> = (0..n0 * n1)
        .into_par_iter()
        .map(|i| {
            let (y, x) = (i / n0, i % n0);
            normalize_to_u8(slice[[x, n1 - 1 - y]], min, max)
        })
        .collect();

    // Buffer length is width * height by construction
    GrayImage::from_raw(n0 as u32, n1 as u32, pixels).unwrap_or_else(|| GrayImage::new(n0 as u32, n1 as u32))
}

/// Rasterized slice under a white title band. Lines of `title` are split on
/// `'\n'` and centred.
///
/// The title font covers `A-Z` (lowercase is drawn as uppercase), `0-9`,
/// space, `_`, `-` and `.`. Other characters leave a blank cell.
pub fn render_slice(slice: ArrayView2<'_, f32>, title: &str) -> GrayImage {
    let body = slice_to_image(&slice);
    let lines: Vec<&str> = title.lines().collect();

    let missing: String = title.chars().filter(|&c| c != '\n' && !has_glyph(c)).collect();
    if !missing.is_empty() {
        debug!("No glyph for {missing:?} in title {title:?}");
    }

    let max_width = lines.iter().map(|l| text_width(l)).max().unwrap_or(0);
    let band_height = if lines.is_empty() {
        0
    } else {
        2 * PADDING + lines.len() as u32 * LINE_HEIGHT * SCALE
    };
    let width = body.width().max(max_width + 2 * PADDING);
    let height = band_height + body.height();

    let mut canvas = GrayImage::from_pixel(width, height, BACKGROUND);
    for (row, line) in lines.iter().enumerate() {
        let x = (width - text_width(line)) / 2;
        let y = PADDING + row as u32 * LINE_HEIGHT * SCALE;
        draw_text(&mut canvas, line, x, y);
    }
    let x = (width - body.width()) / 2;
    image::imageops::replace(&mut canvas, &body, x as i64, band_height as i64);
    canvas
}

/// Write `image` as PNG.
pub fn save_png(image: &GrayImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| Error::RasterizationFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn has_glyph(c: char) -> bool {
    c == ' ' || glyph(c) != [0; 7]
}

fn text_width(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return 0;
    }
    (chars * ADVANCE - 1) * SCALE
}

fn draw_text(canvas: &mut GrayImage, text: &str, x: u32, y: u32) {
    for (n, c) in text.chars().enumerate() {
        let origin = x + n as u32 * ADVANCE * SCALE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..SCALE {
                    for dx in 0..SCALE {
                        let px = origin + col * SCALE + dx;
                        let py = y + row as u32 * SCALE + dy;
                        if px < canvas.width() && py < canvas.height() {
                            canvas.put_pixel(px, py, INK);
                        }
                    }
                }
            }
        }
    }
}

/// 5x7 bitmap rows, most significant of the low five bits is the left
/// column. Lowercase renders as uppercase; anything unknown is blank.
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        _ => [0; 7],
    }
}
