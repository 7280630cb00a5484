//! Optional WebSocket listener (spec §4, §6 `--ws-port`): the same framed
//! packet protocol, carried as one WS binary message per packet instead of
//! the raw length-prefix wire framing, since WS already delimits messages.
//!
//! A WS client's four workers are the same ones a TCP client gets —
//! [`video_render`] and [`audio_render`] only ever touch a client's
//! registry-owned state, never its transport — but receive/send here are
//! bespoke loops over a shared [`WebSocket`] instead of
//! [`crate::workers::receive`]/[`crate::workers::send`], which assume a
//! plain `TcpStream`.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};
use tungstenite::{Message, WebSocket};

use crate::error::{AsciiChatError, Result};
use crate::protocol::crypto::{
    auth_hmac, auth_key, verify_hmac, AuthChallengePayload, AuthResponsePayload, CryptoContext, EphemeralKex, KexPayload,
};
use crate::protocol::handshake::HANDSHAKE_TIMEOUT;
use crate::protocol::packet::{Packet, PacketType};
use crate::registry::{ClientRecord, Worker};
use crate::server::ServerContext;
use crate::workers::{audio_render, receive, video_render};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
/// Read timeout on the underlying socket while draining WS messages, short
/// enough that the receive loop yields the shared socket lock to the send
/// loop frequently.
const WS_POLL: Duration = Duration::from_millis(20);

pub fn serve(ctx: Arc<ServerContext>, address: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((address, port))?;
    listener.set_nonblocking(true)?;
    info!(address, port, "websocket listener started");

    while !ctx.registry.should_exit() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(ctx, stream) {
                        warn!(%peer, error = %e, "websocket client error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "websocket accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    Ok(())
}

fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let registry_stream = stream.try_clone()?;

    let mut ws = tungstenite::accept(stream).map_err(|_| AsciiChatError::HandshakeViolation("websocket upgrade failed"))?;

    let capacity = ctx.admission_capacity();
    let record = ctx.registry.insert_with_capacity(registry_stream, capacity)?;
    info!(client_id = record.id, "websocket client admitted");

    if ctx.encrypt {
        match server_handshake_ws(&mut ws, record.id, &ctx) {
            Ok(crypto) => *record.crypto.lock() = Some(Arc::new(crypto)),
            Err(e) => {
                warn!(client_id = record.id, error = %e, "websocket handshake failed");
                ctx.registry.remove(record.id);
                return Err(e);
            }
        }
    }

    if let Some(sock) = record.socket.lock().as_ref() {
        let _ = sock.set_read_timeout(Some(WS_POLL));
    }

    let ws = Arc::new(Mutex::new(ws));

    let video_handle = {
        let ctx = Arc::clone(&ctx);
        let client = Arc::clone(&record);
        thread::spawn(move || video_render::run(&ctx, &client))
    };
    let audio_handle = {
        let ctx = Arc::clone(&ctx);
        let client = Arc::clone(&record);
        thread::spawn(move || audio_render::run(&ctx, &client))
    };
    let send_handle = {
        let client = Arc::clone(&record);
        let ws = Arc::clone(&ws);
        thread::spawn(move || send_loop(&client, ws))
    };

    receive_loop(&record, &ws);

    record.stop_all();
    record.send_queue.shutdown();
    record.incoming_audio.shutdown();
    let _ = ws.lock().close(None);
    let _ = send_handle.join();
    let _ = video_handle.join();
    let _ = audio_handle.join();
    ctx.registry.remove(record.id);
    *record.crypto.lock() = None;
    info!(client_id = record.id, "websocket client torn down");
    Ok(())
}

fn encode_ws_packet(packet: &Packet, crypto: &Option<Arc<CryptoContext>>) -> Result<Vec<u8>> {
    match crypto {
        Some(c) if !packet.packet_type.is_handshake() => {
            let body = packet.encode_sealed_body()?;
            let sealed = c.outbound.seal(&body, &crate::protocol::packet::MAGIC);
            let mut out = Vec::with_capacity(4 + sealed.len());
            out.extend_from_slice(&crate::protocol::packet::MAGIC);
            out.extend_from_slice(&sealed);
            Ok(out)
        }
        _ => packet.encode(),
    }
}

fn decode_ws_packet(bytes: &[u8], crypto: &Option<Arc<CryptoContext>>) -> Result<Packet> {
    match crypto {
        Some(c) => {
            if bytes.len() < 4 || bytes[0..4] != crate::protocol::packet::MAGIC {
                return Err(AsciiChatError::BadMagic);
            }
            let body = c.inbound.open(&bytes[4..], &crate::protocol::packet::MAGIC)?;
            Packet::decode_sealed_body(&body)
        }
        None => Packet::decode(bytes).map(|(packet, _)| packet),
    }
}

fn receive_loop(client: &Arc<ClientRecord>, ws: &Arc<Mutex<WebSocket<TcpStream>>>) {
    while client.is_alive(Worker::Receive) && client.active.load(Ordering::Acquire) {
        let message = { ws.lock().read() };
        match message {
            Ok(Message::Binary(bytes)) => {
                let crypto = client.crypto.lock().clone();
                match decode_ws_packet(&bytes, &crypto) {
                    Ok(packet) => {
                        if let Err(e) = receive::dispatch(client, packet) {
                            warn!(client_id = client.id, error = %e, "websocket packet dispatch failed");
                        }
                    }
                    Err(e) => warn!(client_id = client.id, error = %e, "malformed websocket packet"),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => break,
        }
    }
    client.active.store(false, Ordering::Release);
    client.stop(Worker::Receive);
}

fn send_loop(client: &Arc<ClientRecord>, ws: Arc<Mutex<WebSocket<TcpStream>>>) {
    while client.is_alive(Worker::Send) {
        let Some(packet) = client.send_queue.dequeue() else { break };
        if !send_one(client, &ws, packet) {
            client.active.store(false, Ordering::Release);
            break;
        }
    }
    while let Some(packet) = client.send_queue.try_dequeue() {
        let _ = send_one(client, &ws, packet);
    }
    client.stop(Worker::Send);
}

fn send_one(client: &Arc<ClientRecord>, ws: &Arc<Mutex<WebSocket<TcpStream>>>, packet: Packet) -> bool {
    let crypto = client.crypto.lock().clone();
    let bytes = match encode_ws_packet(&packet, &crypto) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(client_id = client.id, error = %e, "failed to encode websocket packet");
            return true;
        }
    };
    ws.lock().send(Message::Binary(bytes)).is_ok()
}

/// Server side of the six-packet handshake (spec §4.2), reimplemented over
/// WS binary messages instead of [`crate::protocol::framing`]'s raw-socket
/// reads, since the latter assumes a plain `TcpStream`. Steps mirror
/// [`crate::protocol::handshake::server_handshake`] exactly.
fn server_handshake_ws(ws: &mut WebSocket<TcpStream>, client_id: u32, ctx: &Arc<ServerContext>) -> Result<CryptoContext> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let eph = EphemeralKex::generate();
    let sig = ctx.identity.sign(eph.public.as_bytes());
    let init = KexPayload {
        ephemeral_pub: *eph.public.as_bytes(),
        identity_pub: Some(ctx.identity.verifying_key().to_bytes()),
        signature: Some(sig.to_bytes()),
    };
    send_handshake_packet(ws, Packet::new(PacketType::KeyExchangeInit, client_id, init.encode()))?;

    let response = recv_handshake_packet(ws, PacketType::KeyExchangeResponse, deadline)?;
    let client_kex = KexPayload::decode(&response.payload)?;
    client_kex.verify_signature()?;
    if let Some(allowed) = &ctx.authorized_keys {
        let presented = client_kex
            .identity_pub
            .map(|bytes| ed25519_dalek::VerifyingKey::from_bytes(&bytes))
            .transpose()
            .map_err(|_| AsciiChatError::HandshakeViolation("invalid client identity key"))?
            .ok_or(AsciiChatError::WhitelistReject)?;
        if !allowed.iter().any(|k| k.to_bytes() == presented.to_bytes()) {
            return Err(AsciiChatError::WhitelistReject);
        }
    }

    let shared_secret = eph.diffie_hellman(&client_kex.ephemeral_pub);

    let challenge = AuthChallengePayload::new_random(ctx.password.is_some());
    send_handshake_packet(ws, Packet::new(PacketType::AuthChallenge, client_id, challenge.encode()))?;

    let response = recv_handshake_packet(ws, PacketType::AuthResponse, deadline)?;
    let auth_response = AuthResponsePayload::decode(&response.payload)?;
    let key = auth_key(&shared_secret, ctx.password.as_deref());
    let expected_hmac = auth_hmac(&key, &challenge.server_nonce, &shared_secret);
    if !verify_hmac(&expected_hmac, &auth_response.hmac) {
        send_handshake_packet(ws, Packet::new(PacketType::AuthFailed, client_id, Vec::new()))?;
        return Err(AsciiChatError::PasswordMismatch);
    }

    let server_hmac = auth_hmac(&key, &auth_response.client_nonce, &shared_secret);
    send_handshake_packet(ws, Packet::new(PacketType::ServerAuthResponse, client_id, server_hmac.to_vec()))?;
    send_handshake_packet(ws, Packet::new(PacketType::HandshakeComplete, client_id, Vec::new()))?;

    Ok(CryptoContext::new(&shared_secret, true))
}

fn send_handshake_packet(ws: &mut WebSocket<TcpStream>, packet: Packet) -> Result<()> {
    let bytes = packet.encode()?;
    ws.send(Message::Binary(bytes)).map_err(|_| AsciiChatError::BrokenPipe)
}

fn recv_handshake_packet(ws: &mut WebSocket<TcpStream>, expected: PacketType, deadline: Instant) -> Result<Packet> {
    loop {
        if Instant::now() >= deadline {
            return Err(AsciiChatError::Timeout(HANDSHAKE_TIMEOUT));
        }
        match ws.read() {
            Ok(Message::Binary(bytes)) => {
                let (packet, _) = Packet::decode(&bytes)?;
                if packet.packet_type != expected {
                    return Err(AsciiChatError::HandshakeViolation("unexpected packet type during websocket handshake"));
                }
                return Ok(packet);
            }
            Ok(Message::Close(_)) => return Err(AsciiChatError::ConnectionReset),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return Err(AsciiChatError::ConnectionReset),
        }
    }
}
