//! Audio render worker (spec §4.9): mixes every active peer's latest audio
//! frame for this client, roughly every 5.8 ms (256 samples at 48 kHz).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffers::PcmFrame;
use crate::protocol::packet::{Packet, PacketType};
use crate::protocol::payloads;
use crate::registry::{ClientRecord, Worker};
use crate::server::ServerContext;

const PERIOD: Duration = Duration::from_micros(5_800);

pub fn run(ctx: &Arc<ServerContext>, client: &Arc<ClientRecord>) {
    if !ctx.audio_enabled {
        return;
    }

    while client.is_alive(Worker::AudioRender) && client.active.load(Ordering::Acquire) {
        let tick_start = Instant::now();

        let peers = ctx.registry.active_clients();
        let mut contributions: Vec<PcmFrame> = Vec::new();
        for peer in &peers {
            if peer.id == client.id && !ctx.self_view {
                continue;
            }
            if !peer.has_audio.load(Ordering::Acquire) {
                continue;
            }
            if let Some(frame) = peer.incoming_audio.pop() {
                contributions.push(frame);
            }
        }

        if !contributions.is_empty() {
            let mixed = mix(&contributions);
            let packet = Packet::new(PacketType::AudioBatch, client.id, payloads::encode_audio_batch(&[mixed]));
            let _ = client.send_queue.enqueue(packet);
        }

        let elapsed = tick_start.elapsed();
        if elapsed < PERIOD {
            std::thread::sleep(PERIOD - elapsed);
        }
    }

    client.stop(Worker::AudioRender);
}

/// Sum every contribution sample-wise with saturating clamp to `[-1, 1]`,
/// then divide by the contributor count to normalize (spec §4.9's mixing
/// formula, taken literally: sum-then-clamp before the divide, not the
/// other way around).
fn mix(contributions: &[PcmFrame]) -> PcmFrame {
    let len = contributions.iter().map(|f| f.len()).max().unwrap_or(0);
    let mut out = vec![0.0f32; len];
    for frame in contributions {
        for (i, sample) in frame.iter().enumerate() {
            out[i] = (out[i] + sample).clamp(-1.0, 1.0);
        }
    }
    let count = contributions.len() as f32;
    for sample in &mut out {
        *sample /= count;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_passes_through_unchanged() {
        let mixed = mix(&[vec![0.1, -0.2, 0.3]]);
        assert_eq!(mixed, vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn two_sources_average_after_clamped_sum() {
        let mixed = mix(&[vec![0.6, 0.6], vec![0.6, -0.6]]);
        assert_eq!(mixed[0], 0.5); // sum clamps to 1.0, then /2
        assert_eq!(mixed[1], 0.0);
    }

    #[test]
    fn mismatched_lengths_pad_with_silence() {
        let mixed = mix(&[vec![1.0, 1.0], vec![1.0]]);
        assert_eq!(mixed.len(), 2);
    }
}
