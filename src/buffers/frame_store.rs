//! Double-buffered per-client video frame store (spec §4.3).
//!
//! `commit` never blocks and never overwrites an unconsumed front buffer: if
//! the reader hasn't called [`FrameStore::acquire_latest`] since the last
//! swap, the incoming frame is dropped outright rather than replacing the
//! back buffer, which historically caused silent frame loss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// A decoded RGB8 image, row-major, no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RgbImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * 3);
        Self { width, height, pixels }
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self { width, height, pixels }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Dropped,
}

struct SwapState {
    front_idx: usize,
}

/// One producer (the receive worker), many consumers (render workers).
pub struct FrameStore {
    buffers: [Mutex<RgbImage>; 2],
    new_available: AtomicBool,
    swap: Mutex<SwapState>,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            buffers: [Mutex::new(RgbImage::new(0, 0, Vec::new())), Mutex::new(RgbImage::new(0, 0, Vec::new()))],
            new_available: AtomicBool::new(false),
            swap: Mutex::new(SwapState { front_idx: 0 }),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Called by the receive worker on each decoded incoming frame.
    pub fn commit(&self, frame: RgbImage) -> CommitOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.swap.lock();
        if self.new_available.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return CommitOutcome::Dropped;
        }
        let back_idx = 1 - guard.front_idx;
        *self.buffers[back_idx].lock() = frame;
        guard.front_idx = back_idx;
        self.new_available.store(true, Ordering::Release);
        CommitOutcome::Committed
    }

    /// Called by render workers. Returns `None` if no frame has been
    /// committed since the last call — the caller should reuse its
    /// previously acquired frame.
    pub fn acquire_latest(&self) -> Option<RgbImage> {
        let guard = self.swap.lock();
        if !self.new_available.swap(false, Ordering::AcqRel) {
            return None;
        }
        let idx = guard.front_idx;
        drop(guard);
        Some(self.buffers[idx].lock().clone())
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_frame(tag: u8) -> RgbImage {
        RgbImage::new(1, 1, vec![tag, tag, tag])
    }

    #[test]
    fn slow_reader_drops_all_but_last() {
        let store = FrameStore::new();
        for tag in 0..100u32 {
            store.commit(tagged_frame(tag as u8));
        }
        assert_eq!(store.received(), 100);
        assert_eq!(store.dropped(), 99);
        let latest = store.acquire_latest().expect("a frame was committed");
        assert_eq!(latest, tagged_frame(99));
        assert!(store.acquire_latest().is_none());
    }

    #[test]
    fn dropped_commit_leaves_front_buffer_untouched() {
        let store = FrameStore::new();
        assert_eq!(store.commit(tagged_frame(1)), CommitOutcome::Committed);
        assert_eq!(store.commit(tagged_frame(2)), CommitOutcome::Dropped);
        let latest = store.acquire_latest().unwrap();
        assert_eq!(latest, tagged_frame(1));
    }

    #[test]
    fn commit_after_consume_swaps_again() {
        let store = FrameStore::new();
        store.commit(tagged_frame(1));
        assert_eq!(store.acquire_latest().unwrap(), tagged_frame(1));
        store.commit(tagged_frame(2));
        assert_eq!(store.acquire_latest().unwrap(), tagged_frame(2));
        assert_eq!(store.received(), 2);
        assert_eq!(store.dropped(), 0);
    }
}
