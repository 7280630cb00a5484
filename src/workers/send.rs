//! Send worker (spec §4.8): blocking dequeue loop, sealing every
//! post-handshake packet through the client's negotiated crypto context
//! when one is present.

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::protocol::framing;
use crate::protocol::packet::Packet;
use crate::registry::{ClientRecord, Worker};

pub fn run(client: &Arc<ClientRecord>, mut stream: TcpStream) {
    while client.is_alive(Worker::Send) {
        let Some(packet) = client.send_queue.dequeue() else { break };
        if let Err(e) = send_one(client, &mut stream, packet) {
            warn!(client_id = client.id, error = %e, "send failed");
            client.active.store(false, Ordering::Release);
            break;
        }
    }

    // Best-effort drain of whatever is still queued, so a client mid-teardown
    // doesn't silently lose its last control packets.
    while let Some(packet) = client.send_queue.try_dequeue() {
        let _ = send_one(client, &mut stream, packet);
    }

    client.stop(Worker::Send);
}

fn send_one(client: &Arc<ClientRecord>, stream: &mut TcpStream, packet: Packet) -> Result<()> {
    if packet.packet_type.is_handshake() {
        return framing::send_packet(stream, &packet);
    }
    let crypto = client.crypto.lock().clone();
    match crypto {
        Some(c) => framing::send_packet_secure(stream, &packet, &c.outbound),
        None => framing::send_packet(stream, &packet),
    }
}
