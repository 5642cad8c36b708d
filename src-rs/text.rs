//! Text painting for the report canvas.
//!
//! An outline font loaded from `report.font` is preferred. Without one the
//! built-in 8x8 bitmap font is used; characters it lacks are drawn as a
//! small box encoding the code point, so distinct labels stay distinct.

use std::path::Path;

use ab_glyph::{point, Font, FontArc, GlyphId, PxScale, PxScaleFont, ScaleFont};
use font8x8::{UnicodeFonts, BASIC_FONTS, GREEK_FONTS, LATIN_FONTS};
use image::{Rgba, RgbaImage};

use crate::error::{AppError, Result};

const CELL: u32 = 8;

pub enum TextPainter {
    Bitmap,
    Outline(FontArc),
}

impl std::fmt::Debug for TextPainter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitmap => f.write_str("TextPainter::Bitmap"),
            Self::Outline(_) => f.write_str("TextPainter::Outline"),
        }
    }
}

impl TextPainter {
    /// Outline painter for the font at `path`, or the bitmap painter when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::Bitmap);
        };
        let font_err = |reason: String| AppError::Font {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| font_err(e.to_string()))?;
        let font = FontArc::try_from_vec(bytes).map_err(|e| font_err(e.to_string()))?;
        tracing::debug!(path = %path.display(), "loaded report font");
        Ok(Self::Outline(font))
    }

    /// Whether the painter can render arbitrary Unicode, Hangul included.
    pub fn is_outline(&self) -> bool {
        matches!(self, Self::Outline(_))
    }

    /// Advance width of `text` at a nominal pixel size.
    pub fn width(&self, text: &str, px: u32) -> i32 {
        match self {
            Self::Bitmap => (text.chars().count() as u32 * CELL * bitmap_scale(px)) as i32,
            Self::Outline(font) => {
                let scaled = font.as_scaled(PxScale::from(px as f32));
                let (advance, _) = layout(&scaled, text);
                advance.ceil() as i32
            }
        }
    }

    /// Draw `text` starting at `x` on the baseline `baseline`. Bold strikes twice, one pixel apart.
    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &self,
        img: &mut RgbaImage,
        x: i32,
        baseline: i32,
        text: &str,
        color: Rgba<u8>,
        px: u32,
        bold: bool,
    ) {
        let strikes = if bold { 2 } else { 1 };
        for offset in 0..strikes {
            match self {
                Self::Bitmap => {
                    let scale = bitmap_scale(px);
                    let top = baseline - (CELL * scale) as i32;
                    draw_bitmap_text(img, x + offset, top, text, color, scale);
                }
                Self::Outline(font) => draw_outline_text(img, font, x + offset, baseline, text, color, px),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_right(
        &self,
        img: &mut RgbaImage,
        right: i32,
        baseline: i32,
        text: &str,
        color: Rgba<u8>,
        px: u32,
        bold: bool,
    ) {
        let x = right - self.width(text, px);
        self.draw(img, x, baseline, text, color, px, bold);
    }

    pub fn centered_x(&self, canvas_width: u32, text: &str, px: u32) -> i32 {
        (canvas_width as i32 - self.width(text, px)) / 2
    }
}

fn bitmap_scale(px: u32) -> u32 {
    (px / CELL).max(1)
}

/// Caret positions of every glyph and the total advance.
fn layout(scaled: &PxScaleFont<&FontArc>, text: &str) -> (f32, Vec<(GlyphId, f32)>) {
    let mut caret = 0.0f32;
    let mut prev: Option<GlyphId> = None;
    let mut glyphs = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(prev) = prev {
            caret += scaled.kern(prev, id);
        }
        glyphs.push((id, caret));
        caret += scaled.h_advance(id);
        prev = Some(id);
    }
    (caret, glyphs)
}

fn draw_outline_text(
    img: &mut RgbaImage,
    font: &FontArc,
    x: i32,
    baseline: i32,
    text: &str,
    color: Rgba<u8>,
    px: u32,
) {
    let scale = PxScale::from(px as f32);
    let scaled = font.as_scaled(scale);
    let (_, glyphs) = layout(&scaled, text);
    for (id, caret) in glyphs {
        let glyph = id.with_scale_and_position(scale, point(x as f32 + caret, baseline as f32));
        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let tx = bounds.min.x as i32 + gx as i32;
            let ty = bounds.min.y as i32 + gy as i32;
            let alpha = (f32::from(color[3]) * coverage.clamp(0.0, 1.0)).round() as u8;
            put_blended(img, tx, ty, Rgba([color[0], color[1], color[2], alpha]));
        });
    }
}

/// 8x8 rows for `ch`, one bit per column with the least significant bit leftmost.
pub(crate) fn glyph(ch: char) -> [u8; 8] {
    BASIC_FONTS
        .get(ch)
        .or_else(|| LATIN_FONTS.get(ch))
        .or_else(|| GREEK_FONTS.get(ch))
        .unwrap_or_else(|| code_point_box(ch))
}

/// A 6x6 frame around a 4x4 grid holding 16 bits of the code point.
fn code_point_box(ch: char) -> [u8; 8] {
    let cp = u32::from(ch);
    let bits = ((cp ^ (cp >> 16)) & 0xFFFF) as u16;
    let mut rows = [0u8; 8];
    rows[0] = 0b0011_1111;
    rows[5] = 0b0011_1111;
    for r in 0..4 {
        let nibble = ((bits >> (12 - 4 * r)) & 0xF) as u8;
        rows[r + 1] = 0b0010_0001 | (nibble << 1);
    }
    rows
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) + f64::from(src[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn put_blended(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return;
    }
    let dst = *img.get_pixel(x as u32, y as u32);
    img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        for (row_idx, row_bits) in glyph(ch).iter().enumerate() {
            for col_idx in 0..8 {
                if (row_bits >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        put_blended(img, px + sx, py + sy, color);
                    }
                }
            }
        }
        cursor_x += CELL as i32 * scale_i;
    }
}
