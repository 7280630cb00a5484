//! ASCII composite rendering: glyph/palette cache plus the per-cell
//! resize/luminance/glyph pipeline.

pub mod ascii;
pub mod glyph_cache;

pub use ascii::{render_composite, ColorDepth, TerminalCaps};
pub use glyph_cache::{GlyphTable, DEFAULT_PALETTE};
