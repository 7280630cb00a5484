//! Video render worker (spec §4.9): composites every peer's latest frame
//! into this client's own terminal-sized ASCII frame, roughly 60 times a
//! second, with no catch-up burst if a tick runs long.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffers::RgbImage;
use crate::layout::{self, CellPlacement};
use crate::protocol::packet::{Packet, PacketType};
use crate::registry::{ClientRecord, Worker};
use crate::render::{self, TerminalCaps};
use crate::server::ServerContext;

const PERIOD: Duration = Duration::from_micros(16_667);

pub fn run(ctx: &Arc<ServerContext>, client: &Arc<ClientRecord>) {
    // Last-known frame per peer, reused on ticks where that peer hasn't
    // committed a new one (spec §4.9: "no new frame -> reuse the previous").
    let mut cache: HashMap<u32, RgbImage> = HashMap::new();

    while client.is_alive(Worker::VideoRender) && client.active.load(Ordering::Acquire) {
        let tick_start = Instant::now();

        let peers = ctx.registry.active_clients();
        let (width, height) = client.terminal_size();
        let caps: TerminalCaps = *client.terminal_caps.lock();

        let mut frames: Vec<(u32, RgbImage)> = Vec::new();
        for peer in &peers {
            if peer.id == client.id && !ctx.self_view {
                continue;
            }
            if !peer.has_video.load(Ordering::Acquire) {
                continue;
            }
            if let Some(frame) = peer.incoming_video.acquire_latest() {
                cache.insert(peer.id, frame);
            }
            if let Some(frame) = cache.get(&peer.id) {
                frames.push((peer.id, frame.clone()));
            }
        }
        cache.retain(|id, _| peers.iter().any(|p| p.id == *id));

        if !frames.is_empty() {
            let ids: Vec<u32> = frames.iter().map(|(id, _)| *id).collect();
            let gallery = layout::gallery_layout(width as u32, height as u32, &ids, 0);
            let cells: Vec<(CellPlacement, &RgbImage)> = gallery
                .placements
                .iter()
                .filter_map(|p| frames.iter().find(|(id, _)| *id == p.participant_id).map(|(_, img)| (*p, img)))
                .collect();
            let bytes = render::render_composite(width as u32, height as u32, &cells, &caps, "");
            let packet = Packet::new(PacketType::AsciiFrame, client.id, bytes);
            let _ = client.send_queue.enqueue(packet);
        }

        let elapsed = tick_start.elapsed();
        if elapsed < PERIOD {
            std::thread::sleep(PERIOD - elapsed);
        }
    }

    client.stop(Worker::VideoRender);
}
