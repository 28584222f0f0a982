//! Liveness supervision for registered connections
//!
//! One task per registry entry pings the socket on a fixed period and drives
//! the persisted host status:
//!
//! ```text
//! Online --ping ok--> Online
//! Online --ping fails--> Unreachable        (persist Unreachable)
//! Unreachable --ping ok--> Online           (persist Online)
//! Unreachable --fails past grace--> dropped (deregister, then persist Offline)
//! ```
//!
//! Clients have no grace window: the first failed ping deregisters the
//! session and closes its socket. Every task exits as soon as its entry's
//! completion signal fires, including while a ping is in flight. Host status
//! writes carry the connection's owner epoch, so a supervisor left over from
//! an older connection never overwrites a newer one's status.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::db::schemas::HostStatus;
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::store::Store;

/// Supervisor timings
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub host_ping_interval: Duration,
    /// Read-side deadline for host sockets
    pub host_pong_timeout: Duration,
    /// How long a host may stay unreachable before it is dropped
    pub host_unreachable_grace: Duration,
    pub client_ping_interval: Duration,
    /// Read-side deadline for client sockets
    pub client_pong_timeout: Duration,
    /// Deadline for writing any single frame
    pub write_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            host_ping_interval: Duration::from_secs(30),
            host_pong_timeout: Duration::from_secs(2 * 60 * 60),
            host_unreachable_grace: Duration::from_secs(60 * 60),
            client_ping_interval: Duration::from_secs(15),
            client_pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// What the supervisor must do after a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    MarkOnline,
    MarkUnreachable,
    Drop,
}

/// Per-host liveness state
#[derive(Debug, Clone)]
pub struct HostLiveness {
    status: HostStatus,
    unreachable_since: Option<Instant>,
}

impl Default for HostLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLiveness {
    /// Hosts start Online: InitializeHost persisted that before registering
    pub fn new() -> Self {
        Self {
            status: HostStatus::Online,
            unreachable_since: None,
        }
    }

    pub fn status(&self) -> HostStatus {
        self.status
    }

    pub fn on_ping(&mut self, ok: bool, now: Instant, grace: Duration) -> Transition {
        match (self.status, ok) {
            (HostStatus::Unreachable, true) => {
                self.status = HostStatus::Online;
                self.unreachable_since = None;
                Transition::MarkOnline
            }
            (HostStatus::Unreachable, false) => {
                let since = *self.unreachable_since.get_or_insert(now);
                if now.duration_since(since) >= grace {
                    Transition::Drop
                } else {
                    Transition::None
                }
            }
            (_, true) => Transition::None,
            (_, false) => {
                self.status = HostStatus::Unreachable;
                self.unreachable_since = Some(now);
                Transition::MarkUnreachable
            }
        }
    }
}

/// Spawns and runs the per-entry supervision tasks
pub struct LivenessSupervisor {
    config: LivenessConfig,
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
}

impl LivenessSupervisor {
    pub fn new(
        config: LivenessConfig,
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Start supervising a registered host
    pub fn spawn_host(
        self: &Arc<Self>,
        instance_id: String,
        owner_epoch: String,
        entry: ConnectionEntry,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor
                .supervise_host(instance_id, owner_epoch, entry)
                .await
        })
    }

    /// Start supervising a registered client session
    pub fn spawn_client(self: &Arc<Self>, session_id: String, entry: ConnectionEntry) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.supervise_client(session_id, entry).await })
    }

    async fn ping(&self, entry: &ConnectionEntry) -> bool {
        match tokio::time::timeout(self.config.write_timeout, entry.socket.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Ping failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Ping write timed out");
                false
            }
        }
    }

    async fn persist_status(&self, instance_id: &str, owner_epoch: &str, status: HostStatus) {
        match self
            .store
            .update_host_instance_status(instance_id, status, Some(owner_epoch))
            .await
        {
            Ok(true) => info!(host_instance_id = %instance_id, status = %status, "Host status changed"),
            Ok(false) => warn!(
                host_instance_id = %instance_id,
                owner_epoch = %owner_epoch,
                "Host row missing or owned by a newer connection"
            ),
            Err(e) => error!(
                fault = "application",
                host_instance_id = %instance_id,
                "Failed to persist host status {}: {}",
                status,
                e
            ),
        }
    }

    async fn supervise_host(&self, instance_id: String, owner_epoch: String, entry: ConnectionEntry) {
        let done = entry.done();
        let mut ticker = tokio::time::interval(self.config.host_ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut liveness = HostLiveness::new();

        loop {
            tokio::select! {
                _ = done.cancelled() => {
                    debug!(host_instance_id = %instance_id, "Host supervisor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let ok = self.ping(&entry).await;
            if done.is_cancelled() {
                debug!(host_instance_id = %instance_id, "Host supervisor stopped during ping");
                return;
            }
            match liveness.on_ping(ok, Instant::now(), self.config.host_unreachable_grace) {
                Transition::None => {}
                Transition::MarkOnline => {
                    self.persist_status(&instance_id, &owner_epoch, HostStatus::Online)
                        .await
                }
                Transition::MarkUnreachable => {
                    self.persist_status(&instance_id, &owner_epoch, HostStatus::Unreachable)
                        .await
                }
                Transition::Drop => {
                    // Deregister before persisting so Offline is never observed
                    // while the entry is still routable.
                    if self.registry.hosts.remove_if(&instance_id, entry.connection_id) {
                        warn!(host_instance_id = %instance_id, "Host unreachable past grace window, dropping");
                        self.persist_status(&instance_id, &owner_epoch, HostStatus::Offline)
                            .await;
                        entry.socket.close().await;
                    }
                    return;
                }
            }
        }
    }

    async fn supervise_client(&self, session_id: String, entry: ConnectionEntry) {
        let done = entry.done();
        let mut ticker = tokio::time::interval(self.config.client_ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = done.cancelled() => {
                    debug!(session_id = %session_id, "Client supervisor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !self.ping(&entry).await {
                if self.registry.clients.remove_if(&session_id, entry.connection_id) {
                    info!(session_id = %session_id, "Client stopped answering, deregistered");
                    entry.socket.close().await;
                }
                return;
            }
        }
    }
}
