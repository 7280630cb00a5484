//! CLI configuration surface (spec §6, SPEC_FULL.md §B).
//!
//! Argument parsing itself is out of spec's detailed scope, but a
//! long-running server still needs a real parser; `clap`'s derive API is
//! the pack-wide convention (`mealycpp-ECE4301_Fall2025`, `mmogr-gglib`).

use std::path::PathBuf;

use clap::Parser;

/// Default bind address/port (spec §6).
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 27224;

#[derive(Debug, Clone, Parser)]
#[command(name = "ascii-chat-server", about = "Composite every connected webcam into ASCII art")]
pub struct ServerConfig {
    /// Listen address.
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Listen port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Enable the audio render/mix pipeline in addition to video.
    #[arg(long, default_value_t = true)]
    pub audio: bool,

    /// Write logs to this file in addition to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Require clients to authenticate with this shared password.
    #[arg(long)]
    pub key: Option<String>,

    /// Read the shared password from this file instead of the command line.
    #[arg(long)]
    pub keyfile: Option<PathBuf>,

    /// Ed25519 identity keypair file (PEM/raw) identifying this server to
    /// clients; generated ephemerally if unset.
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Comma-separated list of Ed25519 public keys, or a path to an
    /// authorized_keys-style file, restricting which clients may connect.
    #[arg(long)]
    pub client_keys: Option<String>,

    /// Disable the AEAD crypto envelope entirely (plaintext framed codec
    /// only); forfeits replay protection and identity verification.
    #[arg(long, default_value_t = false)]
    pub no_encrypt: bool,

    /// Maximum simultaneously connected clients.
    #[arg(long, default_value_t = crate::registry::MAX_CLIENTS)]
    pub max_clients: usize,

    /// Admin terminal columns used for the admission terminal-capacity
    /// check (spec §4.11).
    #[arg(long, default_value_t = 80)]
    pub admin_cols: u32,

    /// Admin terminal rows used for the admission terminal-capacity check.
    #[arg(long, default_value_t = 24)]
    pub admin_rows: u32,

    /// Include a participant's own video in their own composite frame
    /// (the default; spec §9's open question, decided in DESIGN.md — a lone
    /// client must see its own image under default settings).
    #[arg(long, default_value_t = true, overrides_with = "no_self_view")]
    pub self_view: bool,

    /// Exclude a participant's own video from their own composite frame.
    #[arg(long, default_value_t = false, overrides_with = "self_view")]
    pub no_self_view: bool,

    /// Also serve the framed packet protocol over a WebSocket listener on
    /// this port, sharing the same dispatcher as the TCP path.
    #[arg(long)]
    pub ws_port: Option<u16>,
}

impl ServerConfig {
    /// Resolved self-view preference honoring whichever flag was passed
    /// last on the command line (clap's `overrides_with` already resolves
    /// which of the two booleans is true).
    pub fn self_view_default(&self) -> bool {
        self.self_view && !self.no_self_view
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ascii-chat-client", about = "Capture webcam/mic and join an ascii-chat server")]
pub struct ClientConfig {
    /// Server address to connect to, `host:port`.
    #[arg(long, default_value = "127.0.0.1:27224")]
    pub server: String,

    /// Shared password for servers requiring one.
    #[arg(long)]
    pub key: Option<String>,

    /// Expected server identity public key, hex or base64, for pinning
    /// (spec §4.2/§6 `--server-key`). If unset, falls back to the
    /// known-hosts TOFU store.
    #[arg(long)]
    pub server_key: Option<String>,

    /// Write one rendered frame to stdout and exit instead of an
    /// interactive session.
    #[arg(long, default_value_t = false)]
    pub snapshot: bool,

    /// Target capture/request frame rate.
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Disable the AEAD crypto envelope (must match the server's setting).
    #[arg(long, default_value_t = false)]
    pub no_encrypt: bool,

    /// Write logs to this file in addition to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::parse_from(["ascii-chat-server"]);
        assert_eq!(cfg.address, DEFAULT_ADDRESS);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.audio);
        assert!(!cfg.no_encrypt);
        assert!(cfg.self_view_default(), "a lone client must see its own image under default settings");
    }

    #[test]
    fn client_config_defaults() {
        let cfg = ClientConfig::parse_from(["ascii-chat-client"]);
        assert_eq!(cfg.server, "127.0.0.1:27224");
        assert_eq!(cfg.fps, 30);
    }
}
