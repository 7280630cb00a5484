//! Global client registry (spec §3): fixed-size slot array plus an
//! `id -> slot` hash index, guarded by a single readers-writer lock.
//!
//! Lock ordering is registry lock -> per-client mutex -> specialized
//! mutexes (frame-store swap, send-queue, crypto) and must never be
//! reversed; no worker holds two per-client mutexes at once.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffers::{AudioRing, FrameStore, SendQueue};
use crate::error::{AsciiChatError, Result};
use crate::protocol::crypto::{CryptoContext, HandshakeState};
use crate::render::TerminalCaps;

/// Hard cap on simultaneously connected clients.
pub const MAX_CLIENTS: usize = 256;

const AUDIO_RING_CAPACITY: usize = 64;
const SEND_QUEUE_CAPACITY: usize = 256;

/// Which of the four per-client workers a liveness flag tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    Receive = 0,
    Send = 1,
    VideoRender = 2,
    AudioRender = 3,
}

/// One connected participant's full state (spec §3 "Client record").
pub struct ClientRecord {
    pub id: u32,
    pub socket: Mutex<Option<TcpStream>>,
    pub active: AtomicBool,
    pub width: AtomicU16,
    pub height: AtomicU16,
    pub terminal_caps: Mutex<TerminalCaps>,
    pub has_video: AtomicBool,
    pub has_audio: AtomicBool,
    pub handshake_state: Mutex<HandshakeState>,
    /// `Arc`-wrapped so readers can clone it out from under the mutex and
    /// seal/open off the per-client record lock, never holding the mutex
    /// across the blocking socket I/O itself (spec §5: "No worker holds any
    /// lock across an I/O system call").
    pub crypto: Mutex<Option<Arc<CryptoContext>>>,
    pub incoming_video: FrameStore,
    pub incoming_audio: AudioRing,
    pub send_queue: SendQueue,
    liveness: [AtomicBool; 4],
}

impl ClientRecord {
    fn new(id: u32, socket: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            id,
            socket: Mutex::new(Some(socket)),
            active: AtomicBool::new(true),
            width: AtomicU16::new(80),
            height: AtomicU16::new(24),
            terminal_caps: Mutex::new(TerminalCaps::default()),
            has_video: AtomicBool::new(false),
            has_audio: AtomicBool::new(false),
            handshake_state: Mutex::new(HandshakeState::Init),
            crypto: Mutex::new(None),
            incoming_video: FrameStore::new(),
            incoming_audio: AudioRing::new(AUDIO_RING_CAPACITY),
            send_queue: SendQueue::new(SEND_QUEUE_CAPACITY),
            liveness: [AtomicBool::new(true), AtomicBool::new(true), AtomicBool::new(true), AtomicBool::new(true)],
        })
    }

    pub fn is_alive(&self, worker: Worker) -> bool {
        self.liveness[worker as usize].load(Ordering::Acquire)
    }

    pub fn stop(&self, worker: Worker) {
        self.liveness[worker as usize].store(false, Ordering::Release);
    }

    /// Clear every worker's liveness flag (teardown step 1, spec §4.11).
    pub fn stop_all(&self) {
        for flag in &self.liveness {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn terminal_size(&self) -> (u16, u16) {
        (self.width.load(Ordering::Acquire), self.height.load(Ordering::Acquire))
    }

    pub fn set_terminal_size(&self, width: u16, height: u16) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }
}

struct RegistryInner {
    slots: Vec<Option<Arc<ClientRecord>>>,
    index: HashMap<u32, usize>,
}

/// The fixed-size client array plus its hash index.
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU32,
    should_exit: AtomicBool,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner { slots: vec![None; MAX_CLIENTS], index: HashMap::new() }),
            next_id: AtomicU32::new(1),
            should_exit: AtomicBool::new(false),
        }
    }

    /// Admit a new connection: find an empty slot, allocate a monotonic
    /// nonzero id, insert. Fails with `RegistryFull` if every slot is taken.
    pub fn insert(&self, socket: TcpStream) -> Result<Arc<ClientRecord>> {
        self.insert_with_capacity(socket, MAX_CLIENTS)
    }

    /// Same as [`Self::insert`], but additionally refused once `capacity_limit`
    /// active slots are occupied — the admission terminal-capacity check
    /// (spec §4.11: "refuse new clients when the minimum cell size for the
    /// current admin terminal would be violated"), evaluated and applied
    /// atomically under the same writer-lock acquisition as the insert.
    pub fn insert_with_capacity(&self, socket: TcpStream, capacity_limit: usize) -> Result<Arc<ClientRecord>> {
        let mut guard = self.inner.write();
        if guard.index.len() >= capacity_limit.min(MAX_CLIENTS) {
            return Err(AsciiChatError::RegistryFull);
        }
        let slot_idx = guard.slots.iter().position(|s| s.is_none()).ok_or(AsciiChatError::RegistryFull)?;
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 {
                break candidate;
            }
        };
        let record = ClientRecord::new(id, socket);
        guard.slots[slot_idx] = Some(Arc::clone(&record));
        guard.index.insert(id, slot_idx);
        Ok(record)
    }

    /// Remove a client by id (teardown step 5, spec §4.11). Idempotent.
    pub fn remove(&self, id: u32) {
        let mut guard = self.inner.write();
        if let Some(slot_idx) = guard.index.remove(&id) {
            guard.slots[slot_idx] = None;
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<ClientRecord>> {
        let guard = self.inner.read();
        let slot_idx = *guard.index.get(&id)?;
        guard.slots[slot_idx].clone()
    }

    /// Snapshot every currently active client's `Arc` and release the
    /// registry lock before returning, so callers never hold it across I/O.
    pub fn active_clients(&self) -> Vec<Arc<ClientRecord>> {
        let guard = self.inner.read();
        guard.slots.iter().flatten().filter(|c| c.active.load(Ordering::Acquire)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_CLIENTS
    }

    pub fn request_shutdown(&self) {
        self.should_exit.store(true, Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let registry = ClientRegistry::new();
        let (_client, server) = loopback_pair();
        let record = registry.insert(server).unwrap();
        let id = record.id;
        assert!(id != 0);
        let found = registry.get(id).unwrap();
        assert_eq!(found.id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ClientRegistry::new();
        let (_client, server) = loopback_pair();
        let record = registry.insert(server).unwrap();
        registry.remove(record.id);
        registry.remove(record.id);
        assert!(registry.get(record.id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn full_registry_rejects_insert() {
        let registry = ClientRegistry::new();
        for _ in 0..MAX_CLIENTS {
            let (_client, server) = loopback_pair();
            registry.insert(server).unwrap();
        }
        let (_client, server) = loopback_pair();
        assert!(matches!(registry.insert(server), Err(AsciiChatError::RegistryFull)));
    }

    #[test]
    fn capacity_limit_rejects_beyond_admin_terminal_size() {
        let registry = ClientRegistry::new();
        let (_client, server) = loopback_pair();
        registry.insert_with_capacity(server, 1).unwrap();
        let (_client, server) = loopback_pair();
        assert!(matches!(registry.insert_with_capacity(server, 1), Err(AsciiChatError::RegistryFull)));
    }

    #[test]
    fn active_clients_snapshot_excludes_inactive() {
        let registry = ClientRegistry::new();
        let (_client, server) = loopback_pair();
        let record = registry.insert(server).unwrap();
        record.active.store(false, Ordering::Release);
        assert!(registry.active_clients().is_empty());
    }
}
