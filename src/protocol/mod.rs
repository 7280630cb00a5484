//! Wire protocol: framed packet codec, crypto envelope, socket framing.

pub mod crypto;
pub mod framing;
pub mod handshake;
pub mod packet;
pub mod payloads;

pub use crypto::{CryptoContext, HandshakeState};
pub use packet::{Packet, PacketType};
