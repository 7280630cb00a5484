//! Single-producer/single-consumer audio ring buffer (spec §4.4).
//!
//! Built on `crossbeam_channel::bounded`, whose internal slot array is the
//! same lock-free bounded MPMC structure the teacher already depends on for
//! its audio buffer pool's free-list — used here in strict SPSC discipline
//! (one receive worker producer, one audio render worker consumer).

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Sample rate in Hz (spec §4.4 / §9 open question: exposed as config,
/// default chosen here per spec's suggested "typical" value).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// Interleaved channel count.
pub const DEFAULT_CHANNELS: usize = 2;
/// Samples per channel per frame (5.33 ms at 48 kHz).
pub const DEFAULT_FRAME_SAMPLES: usize = 256;

/// One fixed-size block of interleaved PCM samples.
pub type PcmFrame = Vec<f32>;

/// Lock-free ring of fixed-size PCM frames with overwrite-oldest-on-full and
/// a shutdown sentinel that makes a blocked/polling consumer return promptly.
pub struct AudioRing {
    tx: Sender<PcmFrame>,
    rx: Receiver<PcmFrame>,
    shutdown: AtomicBool,
}

impl AudioRing {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx, shutdown: AtomicBool::new(false) }
    }

    /// Push a frame. If the ring is full, the oldest queued frame is
    /// discarded to make room — freshness wins over completeness.
    pub fn push(&self, frame: PcmFrame) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let _ = self.rx.try_recv();
                // Both ends are held here, so this can only fail if another
                // push raced us and refilled the slot we just freed; in that
                // case dropping `frame` is the correct drop-oldest outcome.
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => unreachable!("AudioRing owns both channel ends"),
        }
    }

    /// Pop the oldest queued frame. Returns `None` on empty, or
    /// unconditionally once [`Self::shutdown`] has been called.
    pub fn pop(&self) -> Option<PcmFrame> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Wake a polling consumer promptly by making every subsequent `pop`
    /// return `None` regardless of queued content.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_fifo() {
        let ring = AudioRing::new(4);
        ring.push(vec![1.0]);
        ring.push(vec![2.0]);
        assert_eq!(ring.pop(), Some(vec![1.0]));
        assert_eq!(ring.pop(), Some(vec![2.0]));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let ring = AudioRing::new(2);
        ring.push(vec![1.0]);
        ring.push(vec![2.0]);
        ring.push(vec![3.0]); // ring full at push time, 1.0 is evicted
        assert_eq!(ring.pop(), Some(vec![2.0]));
        assert_eq!(ring.pop(), Some(vec![3.0]));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn shutdown_makes_pop_return_none() {
        let ring = AudioRing::new(4);
        ring.push(vec![1.0]);
        ring.shutdown();
        assert_eq!(ring.pop(), None);
        assert!(ring.is_shutdown());
    }
}
