//! Connection registry
//!
//! Process-local maps from logical ID (host instance ID, session ID) to the
//! socket that physically lives on this replica. Nothing here is persisted
//! or shared between replicas; a reconnect always produces a fresh entry.
//!
//! Each entry carries a `CancellationToken` that stops its liveness
//! supervisor. The token is cancelled by whichever call takes the entry out
//! of the map, and a map removal happens at most once per entry, so the
//! signal fires exactly once.
//!
//! Relayed frames go through a bounded per-entry queue drained by a writer
//! task, so a slow socket only backs up its own queue. The writer stops with
//! the entry's completion signal.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{PorticoError, Result};

/// Frames a single entry may have waiting for its socket
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Write side of a live connection
#[async_trait::async_trait]
pub trait Socket: Send + Sync {
    /// Write one binary frame, bounded by the write deadline
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Write a ping control frame, bounded by the write deadline
    async fn ping(&self) -> Result<()>;

    /// Send a close frame; errors are ignored
    async fn close(&self);
}

/// Registry entry for one logical ID
#[derive(Clone)]
pub struct ConnectionEntry {
    pub socket: Arc<dyn Socket>,
    /// Identifies the accepted socket, so a stale path cannot evict a newer entry
    pub connection_id: u64,
    outbound: mpsc::Sender<Bytes>,
    done: CancellationToken,
}

impl ConnectionEntry {
    /// Create an entry and start its writer task. Must run inside a runtime.
    pub fn new(socket: Arc<dyn Socket>, connection_id: u64) -> Self {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let done = CancellationToken::new();
        tokio::spawn(write_loop(
            Arc::clone(&socket),
            connection_id,
            queue,
            done.clone(),
        ));
        Self {
            socket,
            connection_id,
            outbound,
            done,
        }
    }

    /// Completion signal watched by the entry's supervisor
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Queue a frame for the writer task without waiting on the socket
    pub fn enqueue(&self, frame: Bytes) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => PorticoError::Unavailable(format!(
                "outbound queue full for connection {}",
                self.connection_id
            )),
            TrySendError::Closed(_) => PorticoError::WebSocket(format!(
                "connection {} is closed",
                self.connection_id
            )),
        })
    }
}

async fn write_loop(
    socket: Arc<dyn Socket>,
    connection_id: u64,
    mut queue: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            next = queue.recv() => match next {
                Some(frame) => {
                    if let Err(e) = socket.send(frame).await {
                        warn!(connection_id, "Queued write failed: {}", e);
                    }
                }
                None => break,
            }
        }
    }
    debug!(connection_id, "Writer stopped");
}

/// One identity space (hosts or clients)
pub struct ConnectionMap {
    kind: &'static str,
    entries: DashMap<String, ConnectionEntry>,
}

impl ConnectionMap {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    /// Insert an entry. A replaced entry is signalled done.
    pub fn put(&self, id: &str, entry: ConnectionEntry) {
        if let Some(previous) = self.entries.insert(id.to_string(), entry) {
            previous.done.cancel();
            debug!(kind = self.kind, id = %id, "Replaced registry entry");
        }
        debug!(kind = self.kind, id = %id, count = self.entries.len(), "Registered connection");
    }

    pub fn get(&self, id: &str) -> Option<ConnectionEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove an entry and signal it done. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                entry.done.cancel();
                debug!(kind = self.kind, id = %id, count = self.entries.len(), "Removed connection");
                true
            }
            None => false,
        }
    }

    /// Remove only if the entry still belongs to `connection_id`
    pub fn remove_if(&self, id: &str, connection_id: u64) -> bool {
        match self
            .entries
            .remove_if(id, |_, entry| entry.connection_id == connection_id)
        {
            Some((_, entry)) => {
                entry.done.cancel();
                debug!(kind = self.kind, id = %id, count = self.entries.len(), "Removed connection");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// IDs currently held by one accepted socket
    pub fn ids_for_connection(&self, connection_id: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn close_all(&self) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove(id)).count()
    }
}

/// Host and client identity spaces, independently keyed
pub struct ConnectionRegistry {
    pub hosts: ConnectionMap,
    pub clients: ConnectionMap,
    next_connection_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            hosts: ConnectionMap::new("host"),
            clients: ConnectionMap::new("client"),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Allocate an ID for a newly accepted socket
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Signal every supervisor to stop and empty both spaces
    pub fn close_all(&self) -> usize {
        let hosts = self.hosts.close_all();
        let clients = self.clients.close_all();
        debug!(hosts, clients, "Closed all registry entries");
        hosts + clients
    }
}
