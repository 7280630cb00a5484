//! Receive worker (spec §4.8): drives the handshake, then dispatches
//! incoming packets into the client record's buffers and flags.

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AsciiChatError, Result};
use crate::protocol::crypto::{CryptoContext, HandshakeState};
use crate::protocol::framing;
use crate::protocol::handshake;
use crate::protocol::packet::{Packet, PacketType};
use crate::protocol::payloads::{self, StreamKind};
use crate::registry::{ClientRecord, Worker};
use crate::server::ServerContext;

/// Three consecutive non-fatal errors within one second drop the connection
/// (spec §4.8 "error burst").
const ERROR_BURST_LIMIT: u32 = 3;
const ERROR_BURST_WINDOW: Duration = Duration::from_secs(1);

/// Run the handshake (if enabled), then the dispatch loop, until the socket
/// closes, a fatal error occurs, or the liveness flag is cleared by the
/// lifecycle manager.
pub fn run(ctx: &Arc<ServerContext>, client: &Arc<ClientRecord>, mut stream: TcpStream) {
    if ctx.encrypt {
        match run_handshake(ctx, client, &mut stream) {
            Ok(crypto) => {
                *client.crypto.lock() = Some(Arc::new(crypto));
                *client.handshake_state.lock() = HandshakeState::Ready;
            }
            Err(e) => {
                warn!(client_id = client.id, error = %e, "handshake failed");
                client.active.store(false, Ordering::Release);
                client.stop(Worker::Receive);
                return;
            }
        }
    } else {
        *client.handshake_state.lock() = HandshakeState::Ready;
    }

    dispatch_loop(client, stream);
}

/// Drives the six-packet handshake over the raw socket, routing outbound
/// packets through the send queue (priority `Handshake`, never dropped) so
/// they interleave correctly with the send worker, which is already running
/// by the time this is called.
fn run_handshake(ctx: &Arc<ServerContext>, client: &Arc<ClientRecord>, stream: &mut TcpStream) -> Result<CryptoContext> {
    let id = client.id;
    let (crypto, client_identity) =
        handshake::server_handshake(stream, |p| client.send_queue.enqueue(p), id, &ctx.identity, ctx.password.as_deref())?;

    if let Some(allowed) = &ctx.authorized_keys {
        let presented = client_identity.ok_or(AsciiChatError::WhitelistReject)?;
        if !allowed.iter().any(|k| k.to_bytes() == presented.to_bytes()) {
            return Err(AsciiChatError::WhitelistReject);
        }
    }

    Ok(crypto)
}

fn dispatch_loop(client: &Arc<ClientRecord>, mut stream: TcpStream) {
    let mut error_count = 0u32;
    let mut burst_start = Instant::now();

    while client.is_alive(Worker::Receive) {
        let crypto = client.crypto.lock().clone();
        let result = match &crypto {
            Some(c) => framing::recv_packet_secure(&mut stream, &c.inbound),
            None => framing::recv_packet(&mut stream),
        };

        match result {
            Ok(packet) => {
                error_count = 0;
                if let Err(e) = dispatch(client, packet) {
                    warn!(client_id = client.id, error = %e, "packet dispatch failed");
                }
                if !client.active.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(AsciiChatError::Timeout(_)) => continue,
            Err(AsciiChatError::ConnectionReset) | Err(AsciiChatError::BrokenPipe) => break,
            Err(e) => {
                let now = Instant::now();
                if now.duration_since(burst_start) > ERROR_BURST_WINDOW {
                    burst_start = now;
                    error_count = 0;
                }
                error_count += 1;
                warn!(client_id = client.id, error = %e, "receive error");
                if e.is_fatal() || error_count >= ERROR_BURST_LIMIT {
                    break;
                }
            }
        }
    }

    client.active.store(false, Ordering::Release);
    client.stop(Worker::Receive);
}

/// Shared by the WebSocket listener ([`crate::ws`]), which dispatches the
/// same packet types but over WS binary framing instead of a raw socket.
pub(crate) fn dispatch(client: &Arc<ClientRecord>, packet: Packet) -> Result<()> {
    match packet.packet_type {
        PacketType::ImageFrame => {
            let image = payloads::decode_image_frame(&packet.payload)?;
            client.incoming_video.commit(image);
            Ok(())
        }
        PacketType::AudioBatch => {
            let frames = payloads::decode_audio_batch(&packet.payload)?;
            for frame in frames {
                client.incoming_audio.push(frame);
            }
            Ok(())
        }
        PacketType::TerminalSize => {
            let payload = payloads::TerminalSizePayload::decode(&packet.payload)?;
            client.set_terminal_size(payload.width, payload.height);
            *client.terminal_caps.lock() = crate::render::TerminalCaps {
                color_depth: crate::render::ColorDepth::from_u8(payload.color_depth),
                background_color: payload.background_color,
            };
            Ok(())
        }
        PacketType::Ping => {
            let token = payloads::decode_ping_token(&packet.payload)?;
            client.send_queue.enqueue(Packet::new(PacketType::Pong, packet.client_id, payloads::encode_ping_token(token)))
        }
        PacketType::StreamStart => {
            match payloads::decode_stream_kind(&packet.payload)? {
                StreamKind::Video => client.has_video.store(true, Ordering::Release),
                StreamKind::Audio => client.has_audio.store(true, Ordering::Release),
            }
            Ok(())
        }
        PacketType::StreamStop => {
            match payloads::decode_stream_kind(&packet.payload)? {
                StreamKind::Video => client.has_video.store(false, Ordering::Release),
                StreamKind::Audio => client.has_audio.store(false, Ordering::Release),
            }
            Ok(())
        }
        PacketType::ClientLeave => {
            client.active.store(false, Ordering::Release);
            Ok(())
        }
        other => {
            debug!(client_id = client.id, packet_type = ?other, "ignoring unexpected packet type post-handshake");
            Ok(())
        }
    }
}
