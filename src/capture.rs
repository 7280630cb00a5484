//! Capture/display trait seams (SPEC_FULL.md §E).
//!
//! OS-level webcam/microphone capture and terminal emulator rendering are
//! out of spec's scope (spec §1); these traits give the client binary a
//! stable interface to plug a real capture backend behind, while the crate
//! itself only ships a deterministic test-pattern source (used by the
//! scenario-1 single-client snapshot test) and the real `cpal` microphone
//! source in [`crate::audio`].

use crate::buffers::{PcmFrame, RgbImage};
use crate::error::Result;

/// A source of decoded RGB video frames, one at a time, blocking until the
/// next frame is ready (or returning `Ok(None)` at end of stream).
pub trait VideoSource: Send {
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// A source of fixed-size PCM audio frames.
pub trait AudioSource: Send {
    fn next_frame(&mut self) -> Result<Option<PcmFrame>>;
}

/// Deterministic solid-color video generator; there is no webcam capture
/// crate in the retrieval pack, so this is the only `VideoSource`
/// implementation the crate ships (spec §1 "out of scope... webcam
/// capture", SPEC_FULL.md §E).
pub struct TestPatternSource {
    width: u32,
    height: u32,
    rgb: [u8; 3],
    frames_remaining: Option<u32>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self { width, height, rgb, frames_remaining: None }
    }

    /// Emit exactly `count` frames, then end the stream.
    pub fn with_frame_count(mut self, count: u32) -> Self {
        self.frames_remaining = Some(count);
        self
    }
}

impl VideoSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(remaining) = self.frames_remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        Ok(Some(RgbImage::solid(self.width, self.height, self.rgb)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_emits_requested_count_then_ends() {
        let mut src = TestPatternSource::new(16, 16, [0xFF, 0, 0]).with_frame_count(2);
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn unbounded_test_pattern_never_ends() {
        let mut src = TestPatternSource::new(4, 4, [1, 2, 3]);
        for _ in 0..10 {
            assert!(src.next_frame().unwrap().is_some());
        }
    }
}
