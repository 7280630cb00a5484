//! End-to-end scenario 3 (spec §8): a captured encrypted application packet
//! replayed after later packets were accepted must be rejected with
//! `ReplayNonce`, and a replay against one connection must not affect an
//! unrelated one.

use std::net::{TcpListener, TcpStream};
use std::thread;

use ascii_chat::error::AsciiChatError;
use ascii_chat::protocol::crypto::{CryptoContext, EphemeralKex};

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

/// A client's own replayed packet is rejected without disturbing a second,
/// unrelated client's cipher state.
#[test]
fn replayed_packet_rejected_without_affecting_other_client() {
    let secret_a = shared_secret_pair();
    let server_side_a = CryptoContext::new(&secret_a, true);
    let client_side_a = CryptoContext::new(&secret_a, false);

    let secret_b = shared_secret_pair();
    let server_side_b = CryptoContext::new(&secret_b, true);
    let client_side_b = CryptoContext::new(&secret_b, false);

    // Client A sends 20 application packets; the server records the 10th
    // sealed packet to replay later.
    let mut sealed_packets = Vec::new();
    for i in 0..20u32 {
        sealed_packets.push(client_side_a.outbound.seal(format!("packet {i}").as_bytes(), b""));
    }
    let captured_tenth = sealed_packets[9].clone();

    for sealed in &sealed_packets {
        server_side_a.inbound.open(sealed, b"").expect("packets accepted in order");
    }

    // Client B is on a completely independent cipher and is unaffected by
    // anything happening on A's connection.
    let sealed_b = client_side_b.outbound.seal(b"hello from b", b"");
    let opened_b = server_side_b.inbound.open(&sealed_b, b"").expect("client B's own packet is accepted");
    assert_eq!(opened_b, b"hello from b");

    // Replaying A's 10th packet after packet 20 was accepted must fail.
    let err = server_side_a.inbound.open(&captured_tenth, b"").unwrap_err();
    assert!(matches!(err, AsciiChatError::ReplayNonce { .. }), "replay must be rejected as ReplayNonce, got {err:?}");

    // Client B's connection remains healthy after A's replay was rejected.
    let sealed_b_again = client_side_b.outbound.seal(b"still fine", b"");
    let opened_b_again = server_side_b.inbound.open(&sealed_b_again, b"").expect("client B unaffected by A's replay");
    assert_eq!(opened_b_again, b"still fine");
}

/// The same rejection holds when the captured ciphertext is replayed as raw
/// bytes over a live socket, exercising `framing::recv_packet_secure`
/// (outer length prefix + AEAD open) rather than the cipher alone.
#[test]
fn replay_over_loopback_socket_is_rejected() {
    use ascii_chat::protocol::framing;
    use ascii_chat::protocol::packet::{Packet, PacketType};
    use std::io::Write;

    let (mut client_stream, mut server_stream) = loopback_pair();
    let secret = shared_secret_pair();
    let server_crypto = CryptoContext::new(&secret, true);
    let client_crypto = CryptoContext::new(&secret, false);

    // Build the three wire-format byte buffers up front (without sending
    // them) so packet 0's exact bytes can be replayed verbatim afterward.
    let encode = |i: u32| -> Vec<u8> {
        let packet = Packet::new(PacketType::AsciiFrame, 1, format!("frame {i}").into_bytes());
        let body = packet.encode_sealed_body().unwrap();
        let sealed = server_crypto.outbound.seal(&body, b"ACH1");
        let mut out = Vec::with_capacity(8 + sealed.len());
        out.extend_from_slice(b"ACH1");
        out.extend_from_slice(&(sealed.len() as u32).to_le_bytes());
        out.extend_from_slice(&sealed);
        out
    };
    let wire_packets: Vec<Vec<u8>> = (0..3).map(encode).collect();
    let captured_first = wire_packets[0].clone();

    let handle = thread::spawn(move || {
        for bytes in &wire_packets {
            server_stream.write_all(bytes).unwrap();
        }
        // Replay packet 0's exact bytes after packets 0..3 have all gone out.
        server_stream.write_all(&captured_first).unwrap();
    });
    handle.join().unwrap();

    let first = framing::recv_packet_secure(&mut client_stream, &client_crypto.inbound).unwrap();
    assert_eq!(first.payload, b"frame 0");
    let _second = framing::recv_packet_secure(&mut client_stream, &client_crypto.inbound).unwrap();
    let _third = framing::recv_packet_secure(&mut client_stream, &client_crypto.inbound).unwrap();

    let replay_attempt = framing::recv_packet_secure(&mut client_stream, &client_crypto.inbound);
    assert!(matches!(replay_attempt, Err(AsciiChatError::ReplayNonce { .. })));
}
