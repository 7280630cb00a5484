//! Client runtime: connect (with reconnect/backoff), run the handshake,
//! then drive a capture/send loop alongside a receive/stdout loop until
//! disconnected (spec §4.2, §6, §7, §9).

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use rand::Rng;
use tracing::{info, warn};

use crate::audio::CpalAudioSource;
use crate::buffers::{PcmFrame, RgbImage};
use crate::capture::{AudioSource, TestPatternSource, VideoSource};
use crate::config::ClientConfig;
use crate::error::{AsciiChatError, Result};
use crate::keys::{self, KnownHostsStore, PinVerdict};
use crate::protocol::crypto::CryptoContext;
use crate::protocol::framing;
use crate::protocol::handshake;
use crate::protocol::packet::{Packet, PacketType};
use crate::protocol::payloads;

/// Reconnect backoff schedule (spec §9 open question, decided in
/// `DESIGN.md`): initial 10 ms, linear growth `10 + 200*n` ms, capped at
/// 5 s, with jitter of at least 10% of the computed delay.
const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_STEP_MS: u64 = 200;
const BACKOFF_CAP: Duration = Duration::from_secs(5);

fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = if attempt == 0 {
        BACKOFF_INITIAL.as_millis() as u64
    } else {
        10 + BACKOFF_STEP_MS * attempt as u64
    };
    let base = Duration::from_millis(base_ms).min(BACKOFF_CAP);
    let jitter_ms = (base.as_millis() as f64 * rand::thread_rng().gen_range(0.10..0.25)) as u64;
    base + Duration::from_millis(jitter_ms)
}

/// Parse `--server-key` as hex or base64 into a raw 32-byte pin.
fn parse_pin(value: &str) -> Result<[u8; 32]> {
    let bytes = if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        (0..64).step_by(2).map(|i| u8::from_str_radix(&value[i..i + 2], 16)).collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| AsciiChatError::HandshakeViolation("malformed --server-key hex"))?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| AsciiChatError::HandshakeViolation("malformed --server-key base64"))?
    };
    bytes.try_into().map_err(|_| AsciiChatError::HandshakeViolation("--server-key must be 32 bytes"))
}

/// Run the client to completion: connect, handshake, stream, and (unless
/// `--snapshot` or a fatal identity mismatch) reconnect on drop forever
/// until the process is interrupted.
pub fn run(config: ClientConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        let _ = ctrlc::set_handler(move || running.store(false, Ordering::Release));
    }

    let pinned = config.server_key.as_deref().map(parse_pin).transpose()?;
    let default_path = KnownHostsStore::default_path()?;
    let mut known_hosts = KnownHostsStore::load(&default_path)?;

    let (host, port) = split_host_port(&config.server)?;
    let mut attempt = 0u32;

    while running.load(Ordering::Acquire) {
        match run_once(&config, &host, port, pinned, &mut known_hosts, &running) {
            Ok(()) => {
                if config.snapshot {
                    return Ok(());
                }
                attempt = 0;
            }
            Err(ClientError::IdentityMismatch { expected, actual }) => {
                eprintln!("{}", keys::format_mismatch_warning(&expected, &actual));
                std::process::exit(1);
            }
            Err(ClientError::Inner(e)) => {
                warn!(error = %e, "connection lost, will retry");
            }
        }

        if !running.load(Ordering::Acquire) || config.snapshot {
            break;
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        std::thread::sleep(delay);
    }

    Ok(())
}

/// `run_once`'s error surface: either an ordinary recoverable failure (retry
/// with backoff) or a pinned-identity mismatch, which carries the two raw
/// keys so the caller can print the spec's SSH-style warning and abort
/// rather than retrying a connection that may be under attack.
enum ClientError {
    Inner(AsciiChatError),
    IdentityMismatch { expected: [u8; 32], actual: [u8; 32] },
}

impl From<AsciiChatError> for ClientError {
    fn from(e: AsciiChatError) -> Self {
        ClientError::Inner(e)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Inner(AsciiChatError::Io(e))
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or(AsciiChatError::HandshakeViolation("--server must be host:port"))?;
    let port: u16 = port_str.parse().map_err(|_| AsciiChatError::HandshakeViolation("invalid port in --server"))?;
    Ok((host.to_string(), port))
}

fn run_once(
    config: &ClientConfig,
    host: &str,
    port: u16,
    pinned: Option<[u8; 32]>,
    known_hosts: &mut KnownHostsStore,
    running: &Arc<AtomicBool>,
) -> std::result::Result<(), ClientError> {
    let addr = format!("{host}:{port}");
    let socket_addr = addr
        .as_str()
        .to_socket_addrs()
        .map_err(AsciiChatError::Io)?
        .next()
        .ok_or(AsciiChatError::Unreachable)?;
    let stream = TcpStream::connect_timeout(&socket_addr, framing::CONNECT_TIMEOUT)?;
    framing::configure_stream(&stream)?;
    info!(server = %addr, "connected");

    let mut send_stream = stream.try_clone()?;
    let mut recv_stream = stream;

    let client_id = rand::thread_rng().gen::<u32>().max(1);
    let crypto = if config.no_encrypt {
        None
    } else {
        let known = known_hosts.lookup(host, port).cloned();
        let mut verdict_for_store = None;
        let result = handshake::client_handshake(
            &mut recv_stream,
            |p| framing::send_packet(&mut send_stream, &p),
            client_id,
            None,
            config.key.as_deref(),
            |presented| {
                let verdict = keys::verify_pin(pinned, known.as_ref(), presented);
                verdict_for_store = Some((verdict, *presented));
                verdict
            },
        );

        if let Some((PinVerdict::Mismatch, presented)) = verdict_for_store {
            let expected = pinned.or_else(|| known.as_ref().map(|e| e.key)).unwrap_or([0u8; 32]);
            return Err(ClientError::IdentityMismatch { expected, actual: presented });
        }

        let crypto = result?;
        if let Some((PinVerdict::TrustOnFirstUse, presented)) = verdict_for_store {
            let entry = crate::keys::KnownHostEntry {
                host: host.to_string(),
                port,
                key_type: "ed25519".to_string(),
                key: presented,
            };
            let _ = known_hosts.append(entry);
        }
        Some(Arc::new(crypto))
    };

    send_packet(&mut send_stream, &crypto, Packet::new(
        PacketType::TerminalSize,
        client_id,
        payloads::TerminalSizePayload {
            width: terminal_width(),
            height: terminal_height(),
            color_depth: 3,
            background_color: false,
        }
        .encode(),
    ))?;

    if config.snapshot {
        run_snapshot(config, &mut recv_stream, &mut send_stream, &crypto, client_id, running)?;
        return Ok(());
    }

    run_session(config, recv_stream, send_stream, crypto, client_id, running)?;
    Ok(())
}

fn send_packet(stream: &mut TcpStream, crypto: &Option<Arc<CryptoContext>>, packet: Packet) -> Result<()> {
    match crypto {
        Some(c) if !packet.packet_type.is_handshake() => framing::send_packet_secure(stream, &packet, &c.outbound),
        _ => framing::send_packet(stream, &packet),
    }
}

fn recv_packet(stream: &mut TcpStream, crypto: &Option<Arc<CryptoContext>>) -> Result<Packet> {
    match crypto {
        Some(c) => framing::recv_packet_secure(stream, &c.inbound),
        None => framing::recv_packet(stream),
    }
}

/// `--snapshot`: send one test-pattern frame, wait for the corresponding
/// rendered `ASCII_FRAME`, write it to stdout, and return.
fn run_snapshot(
    _config: &ClientConfig,
    recv_stream: &mut TcpStream,
    send_stream: &mut TcpStream,
    crypto: &Option<Arc<CryptoContext>>,
    client_id: u32,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let mut source = TestPatternSource::new(16, 16, [0xFF, 0x00, 0x00]).with_frame_count(1);
    if let Some(frame) = source.next_frame()? {
        send_stream_video(send_stream, crypto, client_id, &frame)?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while running.load(Ordering::Acquire) && Instant::now() < deadline {
        match recv_packet(recv_stream, crypto) {
            Ok(packet) if packet.packet_type == PacketType::AsciiFrame => {
                std::io::stdout().write_all(&packet.payload)?;
                std::io::stdout().flush()?;
                return Ok(());
            }
            Ok(_) => continue,
            Err(AsciiChatError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(AsciiChatError::Timeout(Duration::from_secs(5)))
}

fn send_stream_video(stream: &mut TcpStream, crypto: &Option<Arc<CryptoContext>>, client_id: u32, frame: &RgbImage) -> Result<()> {
    send_packet(stream, crypto, Packet::new(PacketType::StreamStart, client_id, payloads::encode_stream_kind(payloads::StreamKind::Video)))?;
    send_packet(stream, crypto, Packet::new(PacketType::ImageFrame, client_id, payloads::encode_image_frame(frame)))
}

/// Interactive session: one thread captures and sends video (and audio, if
/// a microphone is available), the calling thread reads `ASCII_FRAME`
/// packets and writes their payload straight to stdout (spec §1: terminal
/// rendering itself is out of scope, so the client prints the server's
/// already-rendered bytes verbatim).
fn run_session(
    config: &ClientConfig,
    mut recv_stream: TcpStream,
    mut send_stream: TcpStream,
    crypto: Option<Arc<CryptoContext>>,
    client_id: u32,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let frame_period = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);

    let capture_handle = {
        let running = Arc::clone(running);
        let crypto = crypto.clone();
        std::thread::spawn(move || capture_loop(send_stream, crypto, client_id, frame_period, running))
    };

    let mut error = None;
    while running.load(Ordering::Acquire) {
        match recv_packet(&mut recv_stream, &crypto) {
            Ok(packet) if packet.packet_type == PacketType::AsciiFrame => {
                if std::io::stdout().write_all(&packet.payload).is_err() {
                    break;
                }
                let _ = std::io::stdout().flush();
            }
            Ok(_) => continue,
            Err(AsciiChatError::Timeout(_)) => continue,
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
    let _ = capture_handle.join();
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn capture_loop(
    mut stream: TcpStream,
    crypto: Option<Arc<CryptoContext>>,
    client_id: u32,
    frame_period: Duration,
    running: Arc<AtomicBool>,
) {
    let mut video: Box<dyn VideoSource> = Box::new(TestPatternSource::new(160, 120, [0x20, 0xA0, 0xE0]));
    let mut audio: Option<Box<dyn AudioSource>> = CpalAudioSource::default_input().ok().map(|s| Box::new(s) as Box<dyn AudioSource>);

    let _ = send_packet(&mut stream, &crypto, Packet::new(
        PacketType::StreamStart,
        client_id,
        payloads::encode_stream_kind(payloads::StreamKind::Video),
    ));
    if audio.is_some() {
        let _ = send_packet(&mut stream, &crypto, Packet::new(
            PacketType::StreamStart,
            client_id,
            payloads::encode_stream_kind(payloads::StreamKind::Audio),
        ));
    }

    while running.load(Ordering::Acquire) {
        let tick_start = Instant::now();

        match video.next_frame() {
            Ok(Some(frame)) => {
                let packet = Packet::new(PacketType::ImageFrame, client_id, payloads::encode_image_frame(&frame));
                if send_packet(&mut stream, &crypto, packet).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }

        if let Some(source) = audio.as_mut() {
            if let Ok(Some(frame)) = source.next_frame() {
                let batch: Vec<PcmFrame> = vec![frame];
                let packet = Packet::new(PacketType::AudioBatch, client_id, payloads::encode_audio_batch(&batch));
                let _ = send_packet(&mut stream, &crypto, packet);
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < frame_period {
            std::thread::sleep(frame_period - elapsed);
        }
    }

    let _ = send_packet(&mut stream, &crypto, Packet::new(PacketType::ClientLeave, client_id, Vec::new()));
}

fn terminal_width() -> u16 {
    term_size().0
}

fn terminal_height() -> u16 {
    term_size().1
}

fn term_size() -> (u16, u16) {
    // No terminal-size crate in the dependency stack and querying the
    // controlling tty is out of scope (spec §1); default to the common
    // 80x24 and let an explicit resize (not modeled here) update it.
    (80, 24)
}
