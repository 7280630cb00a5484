//! Drives the six-packet bidirectional handshake state machine (spec §4.2)
//! over the plaintext framed codec. Reads come straight off the socket
//! (handshake packets are never encrypted); writes go through a caller
//! -supplied sink so the server path can route them through a client's
//! [`crate::buffers::SendQueue`] (priority `Handshake`, never dropped) while
//! the client binary can write them directly before splitting its socket
//! into a reader/writer pair.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;

use crate::error::{AsciiChatError, Result};
use crate::keys::PinVerdict;
use crate::protocol::crypto::{
    auth_hmac, auth_key, verify_hmac, AuthChallengePayload, AuthResponsePayload, CryptoContext, EphemeralKex, Identity,
    KexPayload,
};
use crate::protocol::framing;
use crate::protocol::packet::{Packet, PacketType};

/// Spec §5: "handshake full completion 10 s. A stalled handshake drops the
/// connection."
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn recv_expecting(stream: &mut TcpStream, expected: PacketType, deadline: Instant) -> Result<Packet> {
    if Instant::now() >= deadline {
        return Err(AsciiChatError::Timeout(HANDSHAKE_TIMEOUT));
    }
    let packet = framing::recv_packet(stream)?;
    if packet.packet_type != expected {
        return Err(AsciiChatError::HandshakeViolation("unexpected packet type during handshake"));
    }
    Ok(packet)
}

/// Run the server side of the handshake (spec §4.2 steps 1, 4, 5, 7).
/// Returns the negotiated [`CryptoContext`] and, if the client presented
/// one, its identity key (for server-side whitelist enforcement by the
/// caller, since whether a whitelist is even configured is a policy
/// decision outside this function).
pub fn server_handshake(
    stream: &mut TcpStream,
    mut send: impl FnMut(Packet) -> Result<()>,
    client_id: u32,
    identity: &Identity,
    password: Option<&str>,
) -> Result<(CryptoContext, Option<VerifyingKey>)> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let eph = EphemeralKex::generate();
    let sig = identity.sign(eph.public.as_bytes());
    let init = KexPayload {
        ephemeral_pub: *eph.public.as_bytes(),
        identity_pub: Some(identity.verifying_key().to_bytes()),
        signature: Some(sig.to_bytes()),
    };
    send(Packet::new(PacketType::KeyExchangeInit, client_id, init.encode()))?;

    let response = recv_expecting(stream, PacketType::KeyExchangeResponse, deadline)?;
    let client_kex = KexPayload::decode(&response.payload)?;
    client_kex.verify_signature()?;
    let client_identity = client_kex
        .identity_pub
        .map(|bytes| VerifyingKey::from_bytes(&bytes))
        .transpose()
        .map_err(|_| AsciiChatError::HandshakeViolation("invalid client identity key"))?;

    let shared_secret = eph.diffie_hellman(&client_kex.ephemeral_pub);

    let challenge = AuthChallengePayload::new_random(password.is_some());
    send(Packet::new(PacketType::AuthChallenge, client_id, challenge.encode()))?;

    let response = recv_expecting(stream, PacketType::AuthResponse, deadline)?;
    let auth_response = AuthResponsePayload::decode(&response.payload)?;
    let key = auth_key(&shared_secret, password);
    let expected_hmac = auth_hmac(&key, &challenge.server_nonce, &shared_secret);
    if !verify_hmac(&expected_hmac, &auth_response.hmac) {
        send(Packet::new(PacketType::AuthFailed, client_id, Vec::new()))?;
        return Err(AsciiChatError::PasswordMismatch);
    }

    let server_hmac = auth_hmac(&key, &auth_response.client_nonce, &shared_secret);
    send(Packet::new(PacketType::ServerAuthResponse, client_id, server_hmac.to_vec()))?;
    send(Packet::new(PacketType::HandshakeComplete, client_id, Vec::new()))?;

    Ok((CryptoContext::new(&shared_secret, true), client_identity))
}

/// Run the client side of the handshake (spec §4.2 steps 2, 3, 6). `check_pin`
/// receives the server's presented identity key (if any) and decides
/// whether to proceed (spec: MITM pin mismatch aborts the client process;
/// the caller is responsible for printing the warning and exiting).
pub fn client_handshake(
    stream: &mut TcpStream,
    mut send: impl FnMut(Packet) -> Result<()>,
    client_id: u32,
    identity: Option<&Identity>,
    password: Option<&str>,
    mut check_pin: impl FnMut(&[u8; 32]) -> PinVerdict,
) -> Result<CryptoContext> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let init = recv_expecting(stream, PacketType::KeyExchangeInit, deadline)?;
    let server_kex = KexPayload::decode(&init.payload)?;
    server_kex.verify_signature()?;
    if let Some(server_identity) = server_kex.identity_pub {
        match check_pin(&server_identity) {
            PinVerdict::Match | PinVerdict::TrustOnFirstUse => {}
            PinVerdict::Mismatch => return Err(AsciiChatError::IdentityMismatch {
                expected: "pinned/known-hosts key".to_string(),
                actual: hex_key(&server_identity),
            }),
        }
    }

    let eph = EphemeralKex::generate();
    let (identity_pub, signature) = match identity {
        Some(id) => (Some(id.verifying_key().to_bytes()), Some(id.sign(eph.public.as_bytes()).to_bytes())),
        None => (None, None),
    };
    let response = KexPayload { ephemeral_pub: *eph.public.as_bytes(), identity_pub, signature };
    send(Packet::new(PacketType::KeyExchangeResponse, client_id, response.encode()))?;

    let shared_secret = eph.diffie_hellman(&server_kex.ephemeral_pub);

    let challenge_packet = recv_expecting(stream, PacketType::AuthChallenge, deadline)?;
    let challenge = AuthChallengePayload::decode(&challenge_packet.payload)?;
    let key = auth_key(&shared_secret, password);
    let client_hmac = auth_hmac(&key, &challenge.server_nonce, &shared_secret);
    let mut client_nonce = [0u8; 32];
    rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut client_nonce);
    let auth_response = AuthResponsePayload { hmac: client_hmac, client_nonce };
    send(Packet::new(PacketType::AuthResponse, client_id, auth_response.encode()))?;

    let reply = framing::recv_packet(stream)?;
    if reply.packet_type == PacketType::AuthFailed {
        return Err(AsciiChatError::PasswordMismatch);
    }
    if reply.packet_type != PacketType::ServerAuthResponse {
        return Err(AsciiChatError::HandshakeViolation("expected server auth response"));
    }
    if reply.payload.len() != 32 {
        return Err(AsciiChatError::HandshakeViolation("malformed server auth response"));
    }
    let expected_server_hmac = auth_hmac(&key, &client_nonce, &shared_secret);
    if !verify_hmac(&expected_server_hmac, reply.payload[..32].try_into().unwrap()) {
        return Err(AsciiChatError::HandshakeViolation("server failed mutual authentication"));
    }

    let _complete = recv_expecting(stream, PacketType::HandshakeComplete, deadline)?;
    Ok(CryptoContext::new(&shared_secret, false))
}

fn hex_key(key: &[u8; 32]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn full_handshake_agrees_on_shared_secret() {
        let (mut client_stream, mut server_stream) = loopback_pair();
        let mut client_write = client_stream.try_clone().unwrap();
        let mut server_write = server_stream.try_clone().unwrap();
        let server_identity = Identity::generate();
        let server_identity_pub = server_identity.verifying_key();

        let server_thread = thread::spawn(move || {
            server_handshake(
                &mut server_stream,
                |p| framing::send_packet(&mut server_write, &p),
                1,
                &server_identity,
                Some("correct horse"),
            )
        });

        let client_result = client_handshake(
            &mut client_stream,
            |p| framing::send_packet(&mut client_write, &p),
            2,
            None,
            Some("correct horse"),
            |presented| if *presented == server_identity_pub.to_bytes() { PinVerdict::Match } else { PinVerdict::Mismatch },
        );

        let (server_crypto, client_identity) = server_thread.join().unwrap().unwrap();
        assert!(client_identity.is_none());
        let client_crypto = client_result.unwrap();

        let sealed = server_crypto.outbound.seal(b"ready", b"");
        let opened = client_crypto.inbound.open(&sealed, b"").unwrap();
        assert_eq!(opened, b"ready");
    }

    #[test]
    fn wrong_password_fails_auth() {
        let (mut client_stream, mut server_stream) = loopback_pair();
        let mut client_write = client_stream.try_clone().unwrap();
        let mut server_write = server_stream.try_clone().unwrap();
        let server_identity = Identity::generate();

        let server_thread = thread::spawn(move || {
            server_handshake(&mut server_stream, |p| framing::send_packet(&mut server_write, &p), 1, &server_identity, Some("secret"))
        });

        let client_result = client_handshake(
            &mut client_stream,
            |p| framing::send_packet(&mut client_write, &p),
            2,
            None,
            Some("wrong password"),
            |_| PinVerdict::TrustOnFirstUse,
        );

        assert!(server_thread.join().unwrap().is_err());
        assert!(client_result.is_err());
    }
}
