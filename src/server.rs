//! TCP acceptor and per-process server context (spec §4.11, §5, §6).
//!
//! One acceptor thread admits connections and hands each off to
//! [`crate::workers::lifecycle::spawn`], which owns that client's four
//! workers for the rest of its life. The acceptor itself never blocks on a
//! single client's I/O.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{AsciiChatError, Result};
use crate::layout;
use crate::protocol::crypto::Identity;
use crate::registry::ClientRegistry;
use crate::workers::lifecycle;
use crate::ws;

/// Process-wide state shared by every per-client worker (spec §9
/// "Globals": explicit context objects, no back-pointers).
pub struct ServerContext {
    pub registry: Arc<ClientRegistry>,
    pub identity: Identity,
    pub authorized_keys: Option<Vec<VerifyingKey>>,
    pub password: Option<String>,
    pub self_view: bool,
    pub encrypt: bool,
    pub audio_enabled: bool,
    pub admin_cols: u32,
    pub admin_rows: u32,
    pub max_clients: usize,
}

impl ServerContext {
    /// Admission capacity: the smaller of the configured `--max-clients` cap
    /// and the admin terminal's gallery capacity, the policy gate spec
    /// §4.11 adds on top of the registry's own hard cap.
    pub fn admission_capacity(&self) -> usize {
        layout::capacity(self.admin_cols, self.admin_rows).min(self.max_clients).max(1)
    }
}

/// How often the acceptor wakes from a non-blocking `accept` to poll the
/// shutdown flag. Well under [`crate::protocol::framing::ACCEPT_TIMEOUT`],
/// which remains the documented per-accept budget; this is just the poll
/// granularity that keeps shutdown responsive.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Build the identity this server presents during the handshake, loading it
/// from `path` if given, otherwise generating an ephemeral one for the life
/// of the process (spec §6 `--ssh-key`).
fn load_or_generate_identity(path: Option<&std::path::Path>) -> Result<Identity> {
    match path {
        Some(p) => {
            let bytes = std::fs::read(p)?;
            let key_bytes: [u8; 32] =
                bytes.get(..32).and_then(|b| b.try_into().ok()).ok_or(AsciiChatError::HandshakeViolation("malformed identity key file"))?;
            Ok(Identity { signing_key: ed25519_dalek::SigningKey::from_bytes(&key_bytes) })
        }
        None => Ok(Identity::generate()),
    }
}

fn resolve_password(config: &ServerConfig) -> Result<Option<String>> {
    if let Some(key) = &config.key {
        return Ok(Some(key.clone()));
    }
    if let Some(path) = &config.keyfile {
        return Ok(Some(std::fs::read_to_string(path)?.trim().to_string()));
    }
    Ok(None)
}

fn resolve_authorized_keys(config: &ServerConfig) -> Result<Option<Vec<VerifyingKey>>> {
    match &config.client_keys {
        Some(value) => Ok(Some(crate::keys::resolve_client_keys(value)?)),
        None => Ok(None),
    }
}

/// Run the server until `registry.request_shutdown()` is observed (signal
/// handler or an embedder/test). Blocking; returns once the acceptor and
/// every spawned client have unwound.
pub fn run(config: ServerConfig) -> Result<()> {
    let identity = load_or_generate_identity(config.ssh_key.as_deref())?;
    let password = resolve_password(&config)?;
    let authorized_keys = resolve_authorized_keys(&config)?;

    let registry = Arc::new(ClientRegistry::new());
    let ctx = Arc::new(ServerContext {
        registry: Arc::clone(&registry),
        identity,
        authorized_keys,
        password,
        self_view: config.self_view_default(),
        encrypt: !config.no_encrypt,
        audio_enabled: config.audio,
        admin_cols: config.admin_cols,
        admin_rows: config.admin_rows,
        max_clients: config.max_clients,
    });

    {
        let registry = Arc::clone(&registry);
        ctrlc::set_handler(move || registry.request_shutdown())
            .map_err(|_| AsciiChatError::InvalidState("failed to install signal handler"))?;
    }

    if let Some(ws_port) = config.ws_port {
        let ctx = Arc::clone(&ctx);
        let address = config.address.clone();
        std::thread::spawn(move || {
            if let Err(e) = ws::serve(ctx, &address, ws_port) {
                warn!(error = %e, "websocket listener exited");
            }
        });
    }

    let listener = TcpListener::bind((config.address.as_str(), config.port))?;
    listener.set_nonblocking(true)?;
    info!(address = %config.address, port = config.port, "server listening");

    while !registry.should_exit() {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "accepted connection");
                lifecycle::spawn(Arc::clone(&ctx), stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }

    info!("shutdown requested, waiting for clients to drain");
    while registry.len() > 0 {
        std::thread::sleep(ACCEPT_POLL);
    }
    Ok(())
}
