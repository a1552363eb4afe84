/// Set-of-Mark rendering: numbered boxes drawn over the original screenshot.
///
/// Each detection gets an outlined rectangle and its `element_id` printed in a
/// dark tag above the top-left corner, so a downstream model can refer to
/// elements by number.
use base64::Engine as _;
use image::{DynamicImage, RgbaImage};

use crate::errors::{LocatorError, LocatorResult};
use crate::perception::types::Detection;

/// Renders detections onto the image. Failure yields `None`, never an error.
pub trait Annotator: Send + Sync {
    fn render(&self, image: &DynamicImage, detections: &[Detection]) -> Option<String>;
}

/// Red boxes with numeric tags, PNG + base64 encoded.
#[derive(Debug, Clone, Copy)]
pub struct SetOfMarkAnnotator {
    pub colour: [u8; 4],
}

impl Default for SetOfMarkAnnotator {
    fn default() -> Self {
        Self {
            colour: [255, 40, 40, 230],
        }
    }
}

impl Annotator for SetOfMarkAnnotator {
    fn render(&self, image: &DynamicImage, detections: &[Detection]) -> Option<String> {
        match self.annotate_png(image, detections) {
            Ok(png) => Some(base64::engine::general_purpose::STANDARD.encode(png)),
            Err(e) => {
                tracing::warn!(error = %e, "set-of-mark rendering failed");
                None
            }
        }
    }
}

impl SetOfMarkAnnotator {
    /// PNG bytes of `image` with every detection outlined and numbered.
    ///
    /// On wide images (> 1600 px) tags are drawn at 2× so they stay legible.
    pub fn annotate_png(&self, image: &DynamicImage, detections: &[Detection]) -> LocatorResult<Vec<u8>> {
        let mut canvas = image.to_rgba8();
        let (w, h) = canvas.dimensions();
        if w == 0 || h == 0 {
            return Err(LocatorError::Image("cannot annotate an empty image".into()));
        }

        let label_scale: u32 = if w > 1600 { 2 } else { 1 };
        let box_thickness: i32 = if w > 1600 { 3 } else { 2 };

        for (idx, det) in detections.iter().enumerate() {
            let [bx, by, bw, bh] = det.bbox;
            let x1 = bx as i32;
            let y1 = by as i32;
            let x2 = (bx + bw.max(1) - 1) as i32;
            let y2 = (by + bh.max(1) - 1) as i32;

            draw_rect(&mut canvas, x1, y1, x2, y2, self.colour, box_thickness);

            let mark = det.element_id.unwrap_or(idx).to_string();
            let tag_h = (5 * label_scale + 4 * label_scale) as i32;
            // Tag sits above the box, or inside it when the box touches the top edge.
            let tag_y = if y1 >= tag_h { y1 - tag_h } else { y1 };
            draw_tag(&mut canvas, x1.max(0), tag_y.max(0), &mark, self.colour, label_scale);
        }

        let mut out = Vec::new();
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .map_err(|e| LocatorError::Image(format!("PNG encode: {e}")))?;
        Ok(out)
    }
}

// ── Drawing primitives ──────────────────────────────────────────────────────

/// Inclusive rectangle outline, clipped to the canvas.
fn draw_rect(canvas: &mut RgbaImage, x1: i32, y1: i32, x2: i32, y2: i32, col: [u8; 4], thickness: i32) {
    let (w, h) = canvas.dimensions();
    let (iw, ih) = (w as i32, h as i32);

    for t in 0..thickness {
        let ty = y1 + t;
        let by = y2 - t;
        for x in x1..=x2 {
            if x >= 0 && x < iw {
                if ty >= 0 && ty < ih {
                    set_pixel(canvas, x as u32, ty as u32, col);
                }
                if by >= 0 && by < ih {
                    set_pixel(canvas, x as u32, by as u32, col);
                }
            }
        }
    }
    for t in 0..thickness {
        let lx = x1 + t;
        let rx = x2 - t;
        for y in y1..=y2 {
            if y >= 0 && y < ih {
                if lx >= 0 && lx < iw {
                    set_pixel(canvas, lx as u32, y as u32, col);
                }
                if rx >= 0 && rx < iw {
                    set_pixel(canvas, rx as u32, y as u32, col);
                }
            }
        }
    }
}

/// Darkened background plus digits in `col`.
fn draw_tag(canvas: &mut RgbaImage, x: i32, y: i32, text: &str, col: [u8; 4], scale: u32) {
    let (w, h) = canvas.dimensions();
    let step = 5 * scale + scale;
    let pad = 2 * scale;
    let tag_w = text.len() as u32 * step + pad * 2;
    let tag_h = 5 * scale + pad * 2;
    let (x, y) = (x as u32, y as u32);

    for dy in 0..tag_h {
        for dx in 0..tag_w {
            let (px, py) = (x + dx, y + dy);
            if px < w && py < h {
                let p = canvas.get_pixel_mut(px, py);
                p[0] = (p[0] as f32 * 0.2) as u8;
                p[1] = (p[1] as f32 * 0.2) as u8;
                p[2] = (p[2] as f32 * 0.2) as u8;
                p[3] = 255;
            }
        }
    }

    for (i, c) in text.chars().enumerate() {
        let gx = x + pad + i as u32 * step;
        if gx + 5 * scale >= w {
            break;
        }
        draw_digit(canvas, c, gx, y + pad, col, scale);
    }
}

fn draw_digit(canvas: &mut RgbaImage, c: char, px: u32, py: u32, col: [u8; 4], scale: u32) {
    let Some(glyph) = c.to_digit(10).map(|d| DIGITS[d as usize]) else {
        return;
    };
    let (w, h) = canvas.dimensions();
    for (row, &bits) in glyph.iter().enumerate() {
        for bit in 0..5u32 {
            if (bits >> (4 - bit)) & 1 == 0 {
                continue;
            }
            for sy in 0..scale {
                for sx in 0..scale {
                    let x = px + bit * scale + sx;
                    let y = py + row as u32 * scale + sy;
                    if x < w && y < h {
                        set_pixel(canvas, x, y, col);
                    }
                }
            }
        }
    }
}

fn set_pixel(canvas: &mut RgbaImage, x: u32, y: u32, col: [u8; 4]) {
    let p = canvas.get_pixel_mut(x, y);
    let a = col[3] as f32 / 255.0;
    p[0] = (p[0] as f32 * (1.0 - a) + col[0] as f32 * a).round() as u8;
    p[1] = (p[1] as f32 * (1.0 - a) + col[1] as f32 * a).round() as u8;
    p[2] = (p[2] as f32 * (1.0 - a) + col[2] as f32 * a).round() as u8;
    p[3] = 255;
}

/// 5×5 bitmap digits.
const DIGITS: [[u8; 5]; 10] = [
    [0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
    [0b00100, 0b01100, 0b00100, 0b00100, 0b01110],
    [0b01110, 0b10001, 0b00110, 0b01000, 0b11111],
    [0b11110, 0b00001, 0b00110, 0b00001, 0b11110],
    [0b00110, 0b01010, 0b10010, 0b11111, 0b00010],
    [0b11111, 0b10000, 0b11110, 0b00001, 0b11110],
    [0b01110, 0b10000, 0b11110, 0b10001, 0b01110],
    [0b11111, 0b00001, 0b00010, 0b00100, 0b00100],
    [0b01110, 0b10001, 0b01110, 0b10001, 0b01110],
    [0b01110, 0b10001, 0b01111, 0b00001, 0b01110],
];
