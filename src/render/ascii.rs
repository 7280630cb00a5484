//! ASCII rendering pipeline (spec §4.7): resize, luminance, glyph emission,
//! RLE color encoding, composite assembly with cursor-position control
//! sequences between cells.

use crate::buffers::RgbImage;
use crate::layout::CellPlacement;
use crate::render::glyph_cache::{self, GlyphTable};

/// Terminal color capability, as last reported by a client's `TERMINAL_SIZE`
/// negotiation (spec §3 `terminal_caps`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorDepth {
    TrueColor,
    Ansi256,
    Ansi16,
    Monochrome,
}

impl ColorDepth {
    /// Decode the `color_depth` byte of a `TERMINAL_SIZE` payload (spec §3
    /// `terminal_caps`): 0=mono, 1=ansi16, 2=ansi256, 3=truecolor.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Monochrome,
            1 => Self::Ansi16,
            2 => Self::Ansi256,
            _ => Self::TrueColor,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Monochrome => 0,
            Self::Ansi16 => 1,
            Self::Ansi256 => 2,
            Self::TrueColor => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TerminalCaps {
    pub color_depth: ColorDepth,
    pub background_color: bool,
}

impl Default for TerminalCaps {
    fn default() -> Self {
        Self { color_depth: ColorDepth::TrueColor, background_color: false }
    }
}

/// One rendered character cell: glyph plus optional foreground color.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Glyph {
    ch: char,
    rgb: [u8; 3],
}

/// Nearest-neighbor resize with aspect preservation, letterboxed (black
/// padding) to exactly `target_w` x `target_h`.
fn resize_letterboxed(src: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    if target_w == 0 || target_h == 0 || src.width == 0 || src.height == 0 {
        return RgbImage::solid(target_w.max(1), target_h.max(1), [0, 0, 0]);
    }
    let src_aspect = src.width as f64 / src.height as f64;
    let target_aspect = target_w as f64 / target_h as f64;
    let (fit_w, fit_h) = if src_aspect > target_aspect {
        (target_w, ((target_w as f64) / src_aspect).round().max(1.0) as u32)
    } else {
        (((target_h as f64) * src_aspect).round().max(1.0) as u32, target_h)
    };
    let fit_w = fit_w.min(target_w).max(1);
    let fit_h = fit_h.min(target_h).max(1);
    let pad_x = (target_w - fit_w) / 2;
    let pad_y = (target_h - fit_h) / 2;

    let mut pixels = vec![0u8; (target_w * target_h * 3) as usize];
    for y in 0..fit_h {
        let src_y = (y * src.height) / fit_h;
        for x in 0..fit_w {
            let src_x = (x * src.width) / fit_w;
            let src_idx = ((src_y * src.width + src_x) * 3) as usize;
            let dst_x = x + pad_x;
            let dst_y = y + pad_y;
            let dst_idx = ((dst_y * target_w + dst_x) * 3) as usize;
            pixels[dst_idx..dst_idx + 3].copy_from_slice(&src.pixels[src_idx..src_idx + 3]);
        }
    }
    RgbImage::new(target_w, target_h, pixels)
}

/// Fixed-point Rec.601 luminance, bucketed into 64 buckets (`Y >> 2`).
fn luminance_bucket(rgb: [u8; 3]) -> usize {
    let [r, g, b] = rgb;
    let y = (77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8;
    (y as usize >> 2).min(63)
}

/// Whether aspect-fitting `src` onto a `target_w` x `target_h` cell rounds
/// either fitted dimension below one pixel, before `resize_letterboxed`'s own
/// `.max(1)` clamp would otherwise quietly absorb it (spec §4.7
/// `CellTooSmall`).
fn aspect_fit_is_too_small(src: &RgbImage, target_w: u32, target_h: u32) -> bool {
    if src.width == 0 || src.height == 0 {
        return false;
    }
    let src_aspect = src.width as f64 / src.height as f64;
    let target_aspect = target_w as f64 / target_h as f64;
    let (fit_w, fit_h) = if src_aspect > target_aspect {
        (target_w as f64, (target_w as f64) / src_aspect)
    } else {
        ((target_h as f64) * src_aspect, target_h as f64)
    };
    fit_w.round() < 1.0 || fit_h.round() < 1.0
}

/// A cell entirely filled with the space glyph, used for `CellTooSmall`
/// (spec §4.7): a degenerate aspect fit is rendered as a single space rather
/// than a misleading glyph.
fn blank_cell(cell_w: u32, cell_h: u32) -> Vec<Vec<Glyph>> {
    let row = vec![Glyph { ch: ' ', rgb: [0, 0, 0] }; cell_w as usize];
    vec![row; cell_h as usize]
}

fn render_cell_glyphs(src: &RgbImage, cell_w: u32, cell_h: u32, table: &GlyphTable) -> Vec<Vec<Glyph>> {
    if cell_w > 0 && cell_h > 0 && aspect_fit_is_too_small(src, cell_w, cell_h) {
        return blank_cell(cell_w, cell_h);
    }
    let resized = resize_letterboxed(src, cell_w, cell_h);
    let mut rows = Vec::with_capacity(cell_h as usize);
    for y in 0..cell_h {
        let mut row = Vec::with_capacity(cell_w as usize);
        for x in 0..cell_w {
            let idx = ((y * resized.width + x) * 3) as usize;
            let rgb = [resized.pixels[idx], resized.pixels[idx + 1], resized.pixels[idx + 2]];
            let bucket = luminance_bucket(rgb);
            row.push(Glyph { ch: table.lum64[bucket], rgb });
        }
        rows.push(row);
    }
    rows
}

fn rgb_to_ansi256(rgb: [u8; 3]) -> u8 {
    let to_cube = |c: u8| -> u32 { ((c as u32) * 5 + 127) / 255 };
    let (r, g, b) = (to_cube(rgb[0]), to_cube(rgb[1]), to_cube(rgb[2]));
    (16 + 36 * r + 6 * g + b) as u8
}

const ANSI16_PALETTE: [[u8; 3]; 16] = [
    [0, 0, 0],
    [128, 0, 0],
    [0, 128, 0],
    [128, 128, 0],
    [0, 0, 128],
    [128, 0, 128],
    [0, 128, 128],
    [192, 192, 192],
    [128, 128, 128],
    [255, 0, 0],
    [0, 255, 0],
    [255, 255, 0],
    [0, 0, 255],
    [255, 0, 255],
    [0, 255, 255],
    [255, 255, 255],
];

fn rgb_to_ansi16(rgb: [u8; 3]) -> u8 {
    let mut best = 0usize;
    let mut best_dist = u32::MAX;
    for (i, p) in ANSI16_PALETTE.iter().enumerate() {
        let dist = (0..3).map(|c| (rgb[c] as i32 - p[c] as i32).pow(2) as u32).sum();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best as u8
}

fn color_escape(rgb: [u8; 3], depth: ColorDepth) -> Option<String> {
    match depth {
        ColorDepth::Monochrome => None,
        ColorDepth::TrueColor => Some(format!("\x1b[38;2;{};{};{}m", rgb[0], rgb[1], rgb[2])),
        ColorDepth::Ansi256 => Some(format!("\x1b[38;5;{}m", rgb_to_ansi256(rgb))),
        ColorDepth::Ansi16 => {
            let idx = rgb_to_ansi16(rgb);
            let code = if idx < 8 { 30 + idx } else { 90 + (idx - 8) };
            Some(format!("\x1b[{}m", code))
        }
    }
}

fn cursor_to(row: u32, col: u32) -> String {
    format!("\x1b[{};{}H", row + 1, col + 1)
}

/// Encode one row of glyphs with run-length color encoding: a color escape
/// is emitted only when the foreground color changes from the previous
/// glyph in the run.
fn encode_row(row: &[Glyph], caps: &TerminalCaps, out: &mut String) {
    let mut last_color: Option<[u8; 3]> = None;
    for glyph in row {
        if last_color != Some(glyph.rgb) {
            if let Some(seq) = color_escape(glyph.rgb, caps.color_depth) {
                out.push_str(&seq);
            }
            last_color = Some(glyph.rgb);
        }
        out.push(glyph.ch);
    }
}

/// Render every placed cell into one composite ANSI byte stream sized to
/// `width` x `height` character cells.
pub fn render_composite(
    width: u32,
    height: u32,
    cells: &[(CellPlacement, &RgbImage)],
    caps: &TerminalCaps,
    palette: &str,
) -> Vec<u8> {
    let table = glyph_cache::get_or_build(palette);
    let mut out = String::new();
    out.push_str("\x1b[2J"); // clear, then paint every cell explicitly
    let _ = (width, height);

    for (placement, image) in cells {
        let rows = render_cell_glyphs(image, placement.cell_w, placement.cell_h, &table);
        for (r, row) in rows.iter().enumerate() {
            out.push_str(&cursor_to(placement.cell_y + r as u32, placement.cell_x));
            encode_row(row, caps, &mut out);
        }
    }
    out.push_str("\x1b[0m");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CellPlacement;

    #[test]
    fn solid_red_image_renders_high_luminance_glyph() {
        let img = RgbImage::solid(16, 16, [0xFF, 0x00, 0x00]);
        let placement = CellPlacement { participant_id: 1, cell_x: 0, cell_y: 0, cell_w: 80, cell_h: 24 };
        let caps = TerminalCaps { color_depth: ColorDepth::TrueColor, background_color: false };
        let bytes = render_composite(80, 24, &[(placement, &img)], &caps, "");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("38;2;255;0;0"));
        // Red luminance bucket: Y = (77*255+128)>>8 = 77 -> bucket 19, a
        // non-space glyph in the default ramp.
        let table = glyph_cache::get_or_build("");
        let glyph = table.lum64[19];
        assert_ne!(glyph, ' ');
        assert!(text.contains(glyph));
    }

    #[test]
    fn monochrome_caps_emit_no_color_codes() {
        let img = RgbImage::solid(4, 4, [10, 20, 30]);
        let placement = CellPlacement { participant_id: 1, cell_x: 0, cell_y: 0, cell_w: 15, cell_h: 6 };
        let caps = TerminalCaps { color_depth: ColorDepth::Monochrome, background_color: false };
        let bytes = render_composite(15, 6, &[(placement, &img)], &caps, "");
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("38;"));
    }

    #[test]
    fn zero_size_cell_does_not_panic() {
        let img = RgbImage::solid(4, 4, [1, 2, 3]);
        let placement = CellPlacement { participant_id: 1, cell_x: 0, cell_y: 0, cell_w: 0, cell_h: 0 };
        let caps = TerminalCaps::default();
        let _ = render_composite(80, 24, &[(placement, &img)], &caps, "");
    }

    #[test]
    fn degenerate_aspect_fit_renders_a_single_space() {
        // A very wide source image fit into a 1-row-tall cell rounds the
        // fitted height below one pixel; this must render as a blank space
        // rather than the clamped-to-1 glyph the naive resize would pick.
        let img = RgbImage::solid(200, 1, [255, 0, 0]);
        let rows = render_cell_glyphs(&img, 1, 1, &glyph_cache::get_or_build(""));
        assert!(aspect_fit_is_too_small(&img, 1, 1));
        assert_eq!(rows, vec![vec![Glyph { ch: ' ', rgb: [0, 0, 0] }]]);
    }

    #[test]
    fn color_depth_byte_round_trips() {
        for depth in [ColorDepth::Monochrome, ColorDepth::Ansi16, ColorDepth::Ansi256, ColorDepth::TrueColor] {
            assert_eq!(ColorDepth::from_u8(depth.to_u8()), depth);
        }
    }

    #[test]
    fn luminance_bucket_matches_spec_formula() {
        assert_eq!(luminance_bucket([0, 0, 0]), (128u32 >> 8) as usize >> 2);
        assert_eq!(luminance_bucket([255, 255, 255]), 63);
    }
}
