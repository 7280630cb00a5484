//! Socket-level framing helpers: timeouts, keep-alive, and read/write loops
//! that turn a `TcpStream` into a stream of [`Packet`]s (spec §4.1, §6).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{AsciiChatError, Result};
use crate::protocol::packet::Packet;

/// TCP connect timeout (spec §6 defaults).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-send timeout.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-receive timeout.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Listener accept timeout, used to let the acceptor poll a shutdown flag.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Apply the connection's socket options: read/write timeouts and TCP
/// keep-alive (idle 60s, interval 10s, 3 probes).
pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(RECV_TIMEOUT))?;
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let sock = socket2::Socket::from(stream.try_clone()?);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(not(any(target_os = "windows", target_os = "openbsd")))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Read exactly `buf.len()` bytes or fail with a typed error distinguishing
/// a clean peer close (`ConnectionReset`) from a timeout.
fn read_exact_typed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(AsciiChatError::ConnectionReset),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(AsciiChatError::Timeout(RECV_TIMEOUT));
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Err(AsciiChatError::BrokenPipe),
            Err(e) => return Err(AsciiChatError::Io(e)),
        }
    }
    Ok(())
}

const HEADER_PREFIX: usize = 4 + 2 + 4; // magic + type + length, enough to know the frame size

use crate::protocol::crypto::DirectionCipher;

/// Block until a complete packet has been read from `stream`.
///
/// Reads the fixed-size header prefix first to learn the payload length,
/// then reads exactly that many remaining bytes — no unbounded buffering.
pub fn recv_packet(stream: &mut TcpStream) -> Result<Packet> {
    let mut prefix = [0u8; HEADER_PREFIX];
    read_exact_typed(stream, &mut prefix)?;
    let len = u32::from_le_bytes(prefix[6..10].try_into().unwrap());
    if len > crate::protocol::packet::MAX_PAYLOAD {
        return Err(AsciiChatError::TooLarge(len, crate::protocol::packet::MAX_PAYLOAD));
    }
    let remaining_len = 4 + 4 + len as usize; // crc32 + client_id + payload
    let mut rest = vec![0u8; remaining_len];
    read_exact_typed(stream, &mut rest)?;
    let mut full = Vec::with_capacity(HEADER_PREFIX + remaining_len);
    full.extend_from_slice(&prefix);
    full.extend_from_slice(&rest);
    let (packet, _) = Packet::decode(&full)?;
    Ok(packet)
}

/// Write a complete packet, translating write errors to typed failures.
pub fn send_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    let bytes = packet.encode()?;
    match stream.write_all(&bytes) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
            Err(AsciiChatError::Timeout(SEND_TIMEOUT))
        }
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(AsciiChatError::BrokenPipe),
        Err(e) => Err(AsciiChatError::Io(e)),
    }
}

/// Post-handshake, encrypted wire format (spec §4.1): `magic(4B) |
/// sealed_len(4B) | AEAD-sealed{ nonce(8B) | type(2B) | length(4B) |
/// client_id(4B) | payload }`. Only `magic` is clear-text. `sealed_len` is
/// a framing necessity the prose spec doesn't spell out explicitly (the
/// inner length field is itself inside the ciphertext, so the reader needs
/// an outer length to know how many bytes to read before it can attempt to
/// decrypt); see DESIGN.md.
pub fn send_packet_secure(stream: &mut TcpStream, packet: &Packet, cipher: &DirectionCipher) -> Result<()> {
    let body = packet.encode_sealed_body()?;
    let sealed = cipher.seal(&body, &MAGIC_AAD);
    let mut out = Vec::with_capacity(4 + 4 + sealed.len());
    out.extend_from_slice(&crate::protocol::packet::MAGIC);
    out.extend_from_slice(&(sealed.len() as u32).to_le_bytes());
    out.extend_from_slice(&sealed);
    match stream.write_all(&out) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
            Err(AsciiChatError::Timeout(SEND_TIMEOUT))
        }
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(AsciiChatError::BrokenPipe),
        Err(e) => Err(AsciiChatError::Io(e)),
    }
}

pub fn recv_packet_secure(stream: &mut TcpStream, cipher: &DirectionCipher) -> Result<Packet> {
    let mut header = [0u8; 8];
    read_exact_typed(stream, &mut header)?;
    if header[0..4] != crate::protocol::packet::MAGIC {
        return Err(AsciiChatError::BadMagic);
    }
    let sealed_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if sealed_len as u32 > crate::protocol::packet::MAX_PAYLOAD {
        return Err(AsciiChatError::TooLarge(sealed_len as u32, crate::protocol::packet::MAX_PAYLOAD));
    }
    let mut sealed = vec![0u8; sealed_len];
    read_exact_typed(stream, &mut sealed)?;
    let body = cipher.open(&sealed, &MAGIC_AAD)?;
    Packet::decode_sealed_body(&body)
}

const MAGIC_AAD: [u8; 4] = crate::protocol::packet::MAGIC;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crypto::{CryptoContext, EphemeralKex};
    use crate::protocol::packet::PacketType;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn shared_secret_pair() -> [u8; 32] {
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();
        let b_pub = b.public.to_bytes();
        a.diffie_hellman(&b_pub)
    }

    #[test]
    fn secure_round_trip_over_loopback() {
        let (mut client_stream, mut server_stream) = loopback_pair();
        let secret = shared_secret_pair();
        let server_crypto = CryptoContext::new(&secret, true);
        let client_crypto = CryptoContext::new(&secret, false);

        let packet = Packet::new(PacketType::AsciiFrame, 9, vec![1, 2, 3, 4, 5]);
        let handle = thread::spawn(move || send_packet_secure(&mut server_stream, &packet, &server_crypto.outbound));
        let received = recv_packet_secure(&mut client_stream, &client_crypto.inbound).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(received.client_id, 9);
        assert_eq!(received.payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(received.packet_type, PacketType::AsciiFrame);
    }

    #[test]
    fn secure_recv_rejects_bad_magic() {
        let (mut client_stream, mut server_stream) = loopback_pair();
        let secret = shared_secret_pair();
        let client_crypto = CryptoContext::new(&secret, false);
        let handle = thread::spawn(move || {
            let mut bad = vec![0xFFu8; 4];
            bad.extend_from_slice(&0u32.to_le_bytes());
            server_stream.write_all(&bad).unwrap();
        });
        let err = recv_packet_secure(&mut client_stream, &client_crypto.inbound).unwrap_err();
        assert!(matches!(err, AsciiChatError::BadMagic));
        handle.join().unwrap();
    }
}
