//! Glyph/palette cache (spec §4.7): luminance→glyph lookup tables keyed by
//! palette, amortized across concurrent render workers.
//!
//! Guarded by a readers-writer lock with double-checked creation, the same
//! shape as the teacher's `lang.rs` `OnceCell<RwLock<LangMap>>` localization
//! cache: many renders read concurrently, only the first miss on a given
//! palette takes the writer lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

/// Default 10-glyph ramp, used when the requested palette is empty or
/// otherwise invalid (spec §4.7 `PaletteInvalid` fallback).
pub const DEFAULT_PALETTE: &str = " .:-=+*#%@";

const LUM_BUCKETS: usize = 64;

/// Precomputed lookup tables for one palette.
pub struct GlyphTable {
    /// Direct lookup by 64-bucket luminance (`Y >> 2`).
    pub lum64: [char; LUM_BUCKETS],
    /// Direct lookup by full 0..256 fixed-point luminance.
    pub lum256: [char; 256],
    /// Palette index chosen for each of the 64 luminance buckets.
    pub ramp: [u8; LUM_BUCKETS],
}

fn build_table(palette: &[char]) -> GlyphTable {
    let n = palette.len().max(1);
    let mut ramp = [0u8; LUM_BUCKETS];
    let mut lum64 = [' '; LUM_BUCKETS];
    for (bucket, slot) in ramp.iter_mut().enumerate() {
        let idx = (bucket * (n - 1)) / (LUM_BUCKETS - 1);
        *slot = idx as u8;
        lum64[bucket] = palette[idx.min(n - 1)];
    }
    let mut lum256 = [' '; 256];
    for (y, slot) in lum256.iter_mut().enumerate() {
        *slot = lum64[y >> 2];
    }
    GlyphTable { lum64, lum256, ramp }
}

static CACHE: OnceCell<RwLock<HashMap<u64, Arc<GlyphTable>>>> = OnceCell::new();

fn cache() -> &'static RwLock<HashMap<u64, Arc<GlyphTable>>> {
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn palette_key(palette: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    palette.hash(&mut hasher);
    hasher.finish()
}

/// Fetch (or build and cache) the glyph table for `palette`. An empty
/// palette string is treated as `PaletteInvalid` and silently substitutes
/// [`DEFAULT_PALETTE`] — this never fails.
pub fn get_or_build(palette: &str) -> Arc<GlyphTable> {
    let (effective, chars): (&str, Vec<char>) = if palette.is_empty() {
        (DEFAULT_PALETTE, DEFAULT_PALETTE.chars().collect())
    } else {
        (palette, palette.chars().collect())
    };
    let key = palette_key(effective);

    if let Some(table) = cache().read().get(&key) {
        return Arc::clone(table);
    }
    let mut guard = cache().write();
    if let Some(table) = guard.get(&key) {
        return Arc::clone(table);
    }
    let table = Arc::new(build_table(&chars));
    guard.insert(key, Arc::clone(&table));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_lookup_hits_cache() {
        let a = get_or_build("ab cd");
        let b = get_or_build("ab cd");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn empty_palette_falls_back_to_default() {
        let empty = get_or_build("");
        let default = get_or_build(DEFAULT_PALETTE);
        assert!(Arc::ptr_eq(&empty, &default));
    }

    #[test]
    fn ramp_is_monotonic_and_spans_palette() {
        let table = get_or_build("0123456789");
        assert_eq!(table.ramp[0], 0);
        assert_eq!(table.ramp[LUM_BUCKETS - 1], 9);
        for pair in table.ramp.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn lum256_agrees_with_bucketed_lum64() {
        let table = get_or_build("xy");
        for y in 0..256usize {
            assert_eq!(table.lum256[y], table.lum64[y >> 2]);
        }
    }
}
