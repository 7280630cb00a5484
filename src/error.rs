//! Error taxonomy shared by every layer of the server and client.
use thiserror::Error;

/// Every recoverable failure in the crate resolves to one of these variants.
/// Unrecoverable violations of internal invariants (broken lock order, a
/// double-close) are programmer errors and `panic!`/`abort` instead.
#[derive(Debug, Error)]
pub enum AsciiChatError {
    #[error("network timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("host unreachable")]
    Unreachable,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("network io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic bytes")]
    BadMagic,
    #[error("bad crc32 checksum")]
    BadCrc,
    #[error("payload length {0} exceeds maximum {1}")]
    TooLarge(u32, u32),
    #[error("truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown packet type {0}")]
    UnknownType(u16),

    #[error("AEAD decryption/authentication failed")]
    DecryptAuthFail,
    #[error("replayed nonce {nonce} (last accepted {last})")]
    ReplayNonce { nonce: u64, last: u64 },
    #[error("handshake protocol violation: {0}")]
    HandshakeViolation(&'static str),
    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },
    #[error("password authentication failed")]
    PasswordMismatch,
    #[error("client key not in authorized list")]
    WhitelistReject,

    #[error("client registry is full")]
    RegistryFull,
    #[error("allocation failure: {0}")]
    Allocation(&'static str),
    #[error("queue is full")]
    QueueFull,

    #[error("invalid state transition: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, AsciiChatError>;

impl AsciiChatError {
    /// True for codec/crypto failures that must drop the connection outright,
    /// per spec §4.1/§7 ("Fails with" / "Fatal").
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AsciiChatError::BadMagic
                | AsciiChatError::DecryptAuthFail
                | AsciiChatError::ReplayNonce { .. }
                | AsciiChatError::HandshakeViolation(_)
        )
    }
}
