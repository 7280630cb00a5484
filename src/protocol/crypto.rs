//! Cryptographic envelope (spec §4.2): six-packet handshake, per-direction
//! AEAD sealing with replay-safe monotonic nonces.
//!
//! The handshake packets (key exchange, auth challenge/response) always
//! travel over the plaintext [`super::packet`] codec; every packet after
//! `Ready` is sealed with [`CryptoContext::seal`] and the 4-byte `magic` is
//! the only clear-text byte on the wire (spec §4.1).

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{AsciiChatError, Result};
use crate::protocol::packet::PacketType;

type HmacSha256 = Hmac<Sha256>;

/// Handshake progress, one instance per connection (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    KexSent,
    KexCompleted,
    ChallengeSent,
    Authenticated,
    Ready,
    Closing,
    Failed,
}

impl HandshakeState {
    /// Application packets (anything not in [`PacketType::is_handshake`])
    /// are only legal once `Ready`; handshake packets are only legal before it.
    pub fn accepts(self, packet_type: PacketType) -> bool {
        match self {
            HandshakeState::Ready | HandshakeState::Closing => !packet_type.is_handshake(),
            HandshakeState::Failed => false,
            _ => packet_type.is_handshake(),
        }
    }
}

/// Optional long-term identity: an Ed25519 keypair used to sign the
/// ephemeral DH key so peers can pin/verify it.
pub struct Identity {
    pub signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

/// `KEY_EXCHANGE_INIT` / `KEY_EXCHANGE_RESPONSE` payload: an ephemeral X25519
/// public key plus an optional identity key and signature over it.
pub struct KexPayload {
    pub ephemeral_pub: [u8; 32],
    pub identity_pub: Option<[u8; 32]>,
    pub signature: Option<[u8; 64]>,
}

impl KexPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 32 + 64);
        out.push(if self.identity_pub.is_some() { 1 } else { 0 });
        out.extend_from_slice(&self.ephemeral_pub);
        if let Some(ref id) = self.identity_pub {
            out.extend_from_slice(id);
            out.extend_from_slice(&self.signature.expect("identity implies signature"));
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 1 + 32 {
            return Err(AsciiChatError::HandshakeViolation("kex payload too short"));
        }
        let has_identity = buf[0] == 1;
        let mut ephemeral_pub = [0u8; 32];
        ephemeral_pub.copy_from_slice(&buf[1..33]);
        if !has_identity {
            return Ok(Self { ephemeral_pub, identity_pub: None, signature: None });
        }
        if buf.len() < 1 + 32 + 32 + 64 {
            return Err(AsciiChatError::HandshakeViolation("kex identity payload too short"));
        }
        let mut identity_pub = [0u8; 32];
        identity_pub.copy_from_slice(&buf[33..65]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&buf[65..129]);
        Ok(Self { ephemeral_pub, identity_pub: Some(identity_pub), signature: Some(signature) })
    }

    /// Verify the embedded signature over `ephemeral_pub`, if present.
    pub fn verify_signature(&self) -> Result<()> {
        let (Some(identity_pub), Some(sig)) = (self.identity_pub, self.signature) else {
            return Ok(());
        };
        let vk = VerifyingKey::from_bytes(&identity_pub)
            .map_err(|_| AsciiChatError::HandshakeViolation("invalid identity key"))?;
        let sig = Signature::from_bytes(&sig);
        vk.verify(&self.ephemeral_pub, &sig)
            .map_err(|_| AsciiChatError::HandshakeViolation("ephemeral key signature invalid"))
    }
}

/// `AUTH_CHALLENGE` payload: a 32-byte server nonce plus a
/// password-required flag.
pub struct AuthChallengePayload {
    pub server_nonce: [u8; 32],
    pub password_required: bool,
}

impl AuthChallengePayload {
    pub fn new_random(password_required: bool) -> Self {
        let mut server_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut server_nonce);
        Self { server_nonce, password_required }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.extend_from_slice(&self.server_nonce);
        out.push(self.password_required as u8);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 33 {
            return Err(AsciiChatError::HandshakeViolation("auth challenge too short"));
        }
        let mut server_nonce = [0u8; 32];
        server_nonce.copy_from_slice(&buf[0..32]);
        Ok(Self { server_nonce, password_required: buf[32] != 0 })
    }
}

/// `AUTH_RESPONSE` payload: HMAC(server_nonce ∥ shared_secret) under the
/// password-derived key (or the shared secret itself), plus a fresh client
/// nonce used for the server's mutual-auth reply.
pub struct AuthResponsePayload {
    pub hmac: [u8; 32],
    pub client_nonce: [u8; 32],
}

impl AuthResponsePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.hmac);
        out.extend_from_slice(&self.client_nonce);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(AsciiChatError::HandshakeViolation("auth response too short"));
        }
        let mut hmac = [0u8; 32];
        hmac.copy_from_slice(&buf[0..32]);
        let mut client_nonce = [0u8; 32];
        client_nonce.copy_from_slice(&buf[32..64]);
        Ok(Self { hmac, client_nonce })
    }
}

/// Derive the symmetric key authenticating the handshake: either a
/// password-derived key, or the raw shared secret when no password is set.
pub fn auth_key(shared_secret: &[u8; 32], password: Option<&str>) -> [u8; 32] {
    match password {
        None => *shared_secret,
        Some(pw) => {
            let mut mac = HmacSha256::new_from_slice(shared_secret).expect("hmac accepts any key length");
            mac.update(pw.as_bytes());
            let digest = mac.finalize().into_bytes();
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        }
    }
}

/// HMAC(nonce ∥ shared_secret) under `key`, used by both directions of the
/// mutual-auth exchange (spec §4.2 steps 6–7).
pub fn auth_hmac(key: &[u8; 32], nonce: &[u8; 32], shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(nonce);
    mac.update(shared_secret);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Constant-time comparison for HMAC verification (spec §4.2: "Server
/// verifies HMAC in constant time").
pub fn verify_hmac(expected: &[u8; 32], actual: &[u8; 32]) -> bool {
    expected.ct_eq(actual).into()
}

/// One side of the ephemeral X25519 exchange.
pub struct EphemeralKex {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

impl EphemeralKex {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn diffie_hellman(self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        *self.secret.diffie_hellman(&their_public).as_bytes()
    }
}

/// Derive directional AEAD keys from the shared secret via HMAC-SHA256,
/// domain-separated by direction label.
fn derive_key(shared_secret: &[u8; 32], label: &[u8]) -> Key {
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("hmac accepts any key length");
    mac.update(label);
    let digest = mac.finalize().into_bytes();
    *Key::from_slice(&digest)
}

/// Per-direction AEAD sealing/opening context with a monotonic nonce counter
/// (spec §4.1/§4.2: replay protection, per-direction nonces).
pub struct DirectionCipher {
    cipher: ChaCha20Poly1305,
    send_counter: std::sync::atomic::AtomicU64,
    last_accepted: std::sync::atomic::AtomicU64,
    has_accepted: std::sync::atomic::AtomicBool,
}

impl DirectionCipher {
    fn new(key: Key) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&key),
            send_counter: std::sync::atomic::AtomicU64::new(0),
            last_accepted: std::sync::atomic::AtomicU64::new(0),
            has_accepted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn next_nonce(&self) -> u64 {
        self.send_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn nonce_bytes(counter: u64) -> chacha20poly1305::Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..12].copy_from_slice(&counter.to_be_bytes());
        chacha20poly1305::Nonce::clone_from_slice(&bytes)
    }

    /// Seal `plaintext` (the serialized header+payload the spec places
    /// inside the AEAD envelope) under the next nonce, returning
    /// `nonce(8B) ∥ ciphertext`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let counter = self.next_nonce();
        let nonce = Self::nonce_bytes(counter);
        let ct = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .expect("chacha20poly1305 encryption is infallible for valid inputs");
        let mut out = Vec::with_capacity(8 + ct.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ct);
        out
    }

    /// Open a sealed buffer as produced by [`Self::seal`], enforcing strict
    /// nonce monotonicity (replay rejection).
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 8 {
            return Err(AsciiChatError::Truncated { expected: 8, actual: sealed.len() });
        }
        let counter = u64::from_be_bytes(sealed[0..8].try_into().unwrap());
        let last = self.last_accepted.load(std::sync::atomic::Ordering::SeqCst);
        // `has_accepted` tracks "has this context accepted any packet yet",
        // independently of `last_accepted`'s value, since a fresh context
        // and a context that just accepted counter 0 both have `last == 0`
        // but only the latter must reject a second counter-0 packet.
        if self.has_accepted.load(std::sync::atomic::Ordering::SeqCst) && counter <= last {
            return Err(AsciiChatError::ReplayNonce { nonce: counter, last });
        }
        let nonce = Self::nonce_bytes(counter);
        let pt = self
            .cipher
            .decrypt(&nonce, Payload { msg: &sealed[8..], aad })
            .map_err(|_| AsciiChatError::DecryptAuthFail)?;
        self.last_accepted.store(counter, std::sync::atomic::Ordering::SeqCst);
        self.has_accepted.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(pt)
    }
}

/// Both directional ciphers for a connection, plus the shared secret (wiped
/// on drop is best-effort here; `zeroize` is not pulled in, matching the
/// pack's lack of a hard zeroization dependency — the bytes are dropped with
/// the context on disconnect per spec §4.2).
pub struct CryptoContext {
    pub outbound: DirectionCipher,
    pub inbound: DirectionCipher,
}

impl CryptoContext {
    /// `server` selects which derived key is used for which direction so
    /// both ends agree without needing to exchange a role flag.
    pub fn new(shared_secret: &[u8; 32], server: bool) -> Self {
        let (server_to_client, client_to_server) = (
            derive_key(shared_secret, b"ascii-chat-server-to-client"),
            derive_key(shared_secret, b"ascii-chat-client-to-server"),
        );
        if server {
            Self {
                outbound: DirectionCipher::new(server_to_client),
                inbound: DirectionCipher::new(client_to_server),
            }
        } else {
            Self {
                outbound: DirectionCipher::new(client_to_server),
                inbound: DirectionCipher::new(server_to_client),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_secret_pair() -> ([u8; 32], [u8; 32]) {
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();
        let (a_pub, b_pub) = (a.public.to_bytes(), b.public.to_bytes());
        (a.diffie_hellman(&b_pub), b.diffie_hellman(&a_pub))
    }

    #[test]
    fn dh_agrees() {
        let (sa, sb) = shared_secret_pair();
        assert_eq!(sa, sb);
    }

    #[test]
    fn seal_open_round_trip() {
        let (secret, _) = shared_secret_pair();
        let server = CryptoContext::new(&secret, true);
        let client = CryptoContext::new(&secret, false);
        let sealed = server.outbound.seal(b"hello world", b"aad");
        let opened = client.inbound.open(&sealed, b"aad").unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (secret, _) = shared_secret_pair();
        let server = CryptoContext::new(&secret, true);
        let client = CryptoContext::new(&secret, false);
        let mut sealed = server.outbound.seal(b"hello world", b"aad");
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(client.inbound.open(&sealed, b"aad"), Err(AsciiChatError::DecryptAuthFail)));
    }

    #[test]
    fn replay_rejected() {
        let (secret, _) = shared_secret_pair();
        let server = CryptoContext::new(&secret, true);
        let client = CryptoContext::new(&secret, false);
        let first = server.outbound.seal(b"one", b"");
        let second = server.outbound.seal(b"two", b"");
        client.inbound.open(&first, b"").unwrap();
        client.inbound.open(&second, b"").unwrap();
        // Replaying the first (already-consumed, lower-counter) packet must fail.
        assert!(matches!(client.inbound.open(&first, b""), Err(AsciiChatError::ReplayNonce { .. })));
    }

    #[test]
    fn replaying_the_very_first_packet_against_itself_is_rejected() {
        // Regression: `last_accepted` is still 0 immediately after accepting
        // counter 0, so a naive `last == 0` check can't distinguish "nothing
        // accepted yet" from "counter 0 already accepted" and would let this
        // second call through.
        let (secret, _) = shared_secret_pair();
        let server = CryptoContext::new(&secret, true);
        let client = CryptoContext::new(&secret, false);
        let first = server.outbound.seal(b"one", b"");
        client.inbound.open(&first, b"").unwrap();
        assert!(matches!(client.inbound.open(&first, b""), Err(AsciiChatError::ReplayNonce { .. })));
    }

    #[test]
    fn hmac_constant_time_matches() {
        let key = [7u8; 32];
        let nonce = [1u8; 32];
        let secret = [2u8; 32];
        let a = auth_hmac(&key, &nonce, &secret);
        let b = auth_hmac(&key, &nonce, &secret);
        assert!(verify_hmac(&a, &b));
    }

    #[test]
    fn kex_payload_round_trips_with_identity() {
        let id = Identity::generate();
        let eph = EphemeralKex::generate();
        let sig = id.sign(eph.public.as_bytes());
        let payload = KexPayload {
            ephemeral_pub: *eph.public.as_bytes(),
            identity_pub: Some(id.verifying_key().to_bytes()),
            signature: Some(sig.to_bytes()),
        };
        let bytes = payload.encode();
        let decoded = KexPayload::decode(&bytes).unwrap();
        decoded.verify_signature().unwrap();
        assert_eq!(decoded.ephemeral_pub, payload.ephemeral_pub);
    }
}
