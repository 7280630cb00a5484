//! ASCII-Chat: a real-time multi-party terminal video/audio conferencing
//! server and client. The server composites every connected participant's
//! webcam feed into a shared ASCII-art frame rendered back to each client at
//! that client's own terminal dimensions; see `SPEC_FULL.md`/`DESIGN.md` for
//! the full design.

pub mod buffers;
pub mod capture;
pub mod config;
pub mod error;
pub mod keys;
pub mod layout;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod server;
pub mod ws;

pub mod audio;
pub mod client;
pub mod workers;

pub use error::{AsciiChatError, Result};
