//! End-to-end scenario 4 (spec §8): a client pinned to key K1 connecting to a
//! server presenting K2 must abort the handshake before any application
//! data (an `ASCII_FRAME`) is ever processed, and the mismatch warning must
//! name both keys in hex.

use std::net::{TcpListener, TcpStream};
use std::thread;

use ascii_chat::keys::{self, PinVerdict};
use ascii_chat::protocol::crypto::Identity;
use ascii_chat::protocol::framing;
use ascii_chat::protocol::handshake::{client_handshake, server_handshake};

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[test]
fn pinned_key_mismatch_aborts_before_any_application_data() {
    let (mut client_stream, mut server_stream) = loopback_pair();
    let mut client_write = client_stream.try_clone().unwrap();
    let mut server_write = server_stream.try_clone().unwrap();

    // The server actually presents K2...
    let server_identity = Identity::generate();
    let presented_key = server_identity.verifying_key().to_bytes();

    // ...but the client is pinned to an unrelated K1.
    let pinned_key = Identity::generate().verifying_key().to_bytes();
    assert_ne!(pinned_key, presented_key);

    let server_thread = thread::spawn(move || {
        server_handshake(&mut server_stream, |p| framing::send_packet(&mut server_write, &p), 1, &server_identity, None)
    });

    let mut observed_presented = None;
    let client_result = client_handshake(&mut client_stream, |p| framing::send_packet(&mut client_write, &p), 2, None, None, |presented| {
        observed_presented = Some(*presented);
        if *presented == pinned_key {
            PinVerdict::Match
        } else {
            PinVerdict::Mismatch
        }
    });

    // The client must reject before completing the handshake, so no
    // CryptoContext — and therefore no ASCII_FRAME decoding — is ever
    // reachable on this connection.
    assert!(client_result.is_err(), "client must abort the handshake on a pin mismatch");
    assert_eq!(observed_presented, Some(presented_key));

    // The server side either completes (it has no way to know the client
    // rejected it) or errors out once the client drops the connection; both
    // are acceptable, but it must never hand back a successful context that
    // the client also accepted.
    let _ = server_thread.join();

    let warning = keys::format_mismatch_warning(&pinned_key, &presented_key);
    let expected_hex: String = pinned_key.iter().map(|b| format!("{b:02x}")).collect();
    let actual_hex: String = presented_key.iter().map(|b| format!("{b:02x}")).collect();
    assert!(warning.contains(&expected_hex), "warning must contain the pinned key K1 in hex");
    assert!(warning.contains(&actual_hex), "warning must contain the presented key K2 in hex");
}

#[test]
fn verify_pin_reports_mismatch_against_pinned_key() {
    let pinned = [0xABu8; 32];
    let presented = [0xCDu8; 32];
    assert_eq!(keys::verify_pin(Some(pinned), None, &presented), PinVerdict::Mismatch);
    assert_eq!(keys::verify_pin(Some(pinned), None, &pinned), PinVerdict::Match);
    assert_eq!(keys::verify_pin(None, None, &presented), PinVerdict::TrustOnFirstUse);
}
