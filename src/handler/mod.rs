//! Session/host protocol handler
//!
//! Dispatches decoded frames from one socket. Replies to the originating
//! socket are written directly; anything addressed to another logical ID
//! (a host instance or a session) is published on the bus and reaches its
//! socket through a relay loop, wherever that socket lives.
//!
//! Handler errors never end the connection: [`ProtocolHandler::handle_frame`]
//! turns them into an Exception frame carrying the request's correlation ID.

mod client;
mod host;
mod pages;

pub use pages::{reconcile_pages, validate_declarations, PagePlan};

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::db::schemas::HostStatus;
use crate::liveness::LivenessSupervisor;
use crate::protocol::{Frame, Payload};
use crate::pubsub::PubSub;
use crate::registry::{ConnectionRegistry, Socket};
use crate::store::Store;
use crate::types::{ErrorReport, PorticoError, Result};

/// Per-socket state held by the read loop
pub struct Connection {
    pub connection_id: u64,
    pub socket: Arc<dyn Socket>,
    pub role: Role,
}

pub enum Role {
    Host(HostState),
    Client(ClientState),
}

pub struct HostState {
    /// From the upgrade request's instance ID header
    pub instance_id: String,
    /// Set once InitializeHost has committed
    pub binding: Option<HostBinding>,
}

#[derive(Debug, Clone)]
pub struct HostBinding {
    pub api_key_id: String,
    pub organization_id: String,
    /// `owner_epoch` this connection stamped on the host row
    pub owner_epoch: String,
}

pub struct ClientState {
    pub principal: Principal,
    /// Sessions this socket registered
    pub sessions: HashSet<String>,
}

impl Connection {
    pub fn host(connection_id: u64, socket: Arc<dyn Socket>, instance_id: impl Into<String>) -> Self {
        Self {
            connection_id,
            socket,
            role: Role::Host(HostState {
                instance_id: instance_id.into(),
                binding: None,
            }),
        }
    }

    pub fn client(connection_id: u64, socket: Arc<dyn Socket>, principal: Principal) -> Self {
        Self {
            connection_id,
            socket,
            role: Role::Client(ClientState {
                principal,
                sessions: HashSet::new(),
            }),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host(_))
    }

    /// Write a frame straight back to this socket
    pub async fn reply(&self, frame: Frame) -> Result<()> {
        self.socket.send(frame.encode()?).await
    }

    fn host_state(&mut self, kind: &str) -> Result<&mut HostState> {
        match &mut self.role {
            Role::Host(state) => Ok(state),
            Role::Client(_) => Err(PorticoError::InvalidArgument(format!(
                "{} is only accepted on host connections",
                kind
            ))),
        }
    }

    fn client_state(&mut self, kind: &str) -> Result<&mut ClientState> {
        match &mut self.role {
            Role::Client(state) => Ok(state),
            Role::Host(_) => Err(PorticoError::InvalidArgument(format!(
                "{} is only accepted on client connections",
                kind
            ))),
        }
    }
}

pub struct ProtocolHandler {
    store: Arc<dyn Store>,
    pubsub: Arc<dyn PubSub>,
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<LivenessSupervisor>,
    /// Replica identity used in host `owner_epoch` stamps
    node_id: String,
    expose_error_stacks: bool,
}

impl ProtocolHandler {
    pub fn new(
        store: Arc<dyn Store>,
        pubsub: Arc<dyn PubSub>,
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<LivenessSupervisor>,
    ) -> Self {
        Self {
            store,
            pubsub,
            registry,
            supervisor,
            node_id: Uuid::new_v4().to_string(),
            expose_error_stacks: false,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Include stack traces in Exception frames for server faults
    pub fn with_exposed_stacks(mut self, expose: bool) -> Self {
        self.expose_error_stacks = expose;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn owner_epoch(&self, connection_id: u64) -> String {
        format!("{}:{}", self.node_id, connection_id)
    }

    /// Decode and dispatch one binary frame, answering failures with an
    /// Exception frame
    pub async fn handle_frame(&self, conn: &mut Connection, raw: Bytes) {
        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.report(conn, String::new(), None, e).await;
                return;
            }
        };

        let id = frame.id.clone();
        let session_id = frame.session_id().map(str::to_string);
        debug!(id = %id, kind = frame.kind(), "Dispatching frame");

        if let Err(e) = self.dispatch(conn, frame, raw).await {
            self.report(conn, id, session_id, e).await;
        }
    }

    async fn dispatch(&self, conn: &mut Connection, frame: Frame, raw: Bytes) -> Result<()> {
        let kind = frame.kind();
        let Frame { id, payload } = frame;

        match payload {
            Payload::InitializeHost(msg) => self.initialize_host(conn, &id, msg).await,
            Payload::InitializeClient(msg) => self.initialize_client(conn, &id, msg).await,
            Payload::CloseSession(msg) => self.close_session(conn, &id, msg).await,
            Payload::RerunPage(msg) => {
                self.relay_to_host(conn, kind, &msg.session_id, Some(&msg.page_id), raw)
                    .await
            }
            Payload::ScriptFinished(msg) => {
                self.relay_to_client(conn, kind, &msg.session_id, raw).await
            }
            Payload::RenderWidget(msg) => {
                if conn.is_host() {
                    self.relay_to_client(conn, kind, &msg.session_id, raw).await
                } else {
                    self.relay_to_host(conn, kind, &msg.session_id, None, raw)
                        .await
                }
            }
            Payload::Exception(msg) => {
                let session_id = msg.session_id.ok_or_else(|| {
                    PorticoError::InvalidArgument("Exception frames must name a session".into())
                })?;
                if conn.is_host() {
                    self.relay_to_client(conn, kind, &session_id, raw).await
                } else {
                    self.relay_to_host(conn, kind, &session_id, None, raw).await
                }
            }
            Payload::InitializeHostCompleted(_) | Payload::InitializeClientCompleted(_) => Err(
                PorticoError::InvalidArgument(format!("{} is sent by the server only", kind)),
            ),
        }
    }

    /// Answer a frame that could not be dispatched at all
    pub async fn reject(&self, conn: &Connection, err: PorticoError) {
        self.report(conn, String::new(), None, err).await;
    }

    /// Log an error by fault class and send it back as an Exception frame
    async fn report(
        &self,
        conn: &Connection,
        id: String,
        session_id: Option<String>,
        err: PorticoError,
    ) {
        let report = ErrorReport::new(&err);
        if err.is_server_fault() {
            error!(
                fault = "application",
                id = %id,
                status = report.status.as_u16(),
                "{}",
                err
            );
        } else {
            warn!(
                fault = "user",
                id = %id,
                status = report.status.as_u16(),
                "{}",
                err
            );
        }

        let frame = Frame::exception(id, session_id, &report, self.expose_error_stacks);
        if let Err(e) = conn.reply(frame).await {
            debug!("Could not deliver exception frame: {}", e);
        }
    }

    /// Called once when the read loop ends
    pub async fn disconnect(&self, conn: &mut Connection) {
        let connection_id = conn.connection_id;
        match &mut conn.role {
            Role::Host(state) => {
                let Some(binding) = &state.binding else {
                    return;
                };
                if self.registry.hosts.remove_if(&state.instance_id, connection_id) {
                    match self
                        .store
                        .update_host_instance_status(
                            &state.instance_id,
                            HostStatus::Offline,
                            Some(&binding.owner_epoch),
                        )
                        .await
                    {
                        Ok(true) => debug!(host_instance_id = %state.instance_id, "Host disconnected, marked offline"),
                        Ok(false) => debug!(
                            host_instance_id = %state.instance_id,
                            "Host disconnected after re-initializing elsewhere, status left alone"
                        ),
                        Err(e) => error!(
                            fault = "application",
                            host_instance_id = %state.instance_id,
                            "Failed to mark host offline: {}",
                            e
                        ),
                    }
                }
            }
            Role::Client(state) => {
                for session_id in state.sessions.drain() {
                    if self.registry.clients.remove_if(&session_id, connection_id) {
                        debug!(session_id = %session_id, "Client disconnected, deregistered");
                    }
                }
            }
        }
    }
}
