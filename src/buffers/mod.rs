//! Per-client buffering: video frame store, audio ring, outbound send queue.

pub mod audio_ring;
pub mod frame_store;
pub mod send_queue;

pub use audio_ring::{AudioRing, PcmFrame};
pub use frame_store::{CommitOutcome, FrameStore, RgbImage};
pub use send_queue::{Priority, SendQueue};
