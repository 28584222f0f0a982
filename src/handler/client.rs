//! Client-side operations: InitializeClient, CloseSession, host selection
//! and client-originated relays

use bytes::Bytes;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Connection, ProtocolHandler};
use crate::auth::Principal;
use crate::db::schemas::{HostInstanceDoc, HostStatus, PageDoc, SessionDoc};
use crate::protocol::{
    CloseSession, Frame, InitializeClient, InitializeClientCompleted, Payload,
};
use crate::pubsub::Channel;
use crate::registry::ConnectionEntry;
use crate::types::{PorticoError, Result};

impl ProtocolHandler {
    /// Ping a host: directly when its socket is local, via the bus otherwise
    async fn host_answers(&self, instance_id: &str) -> bool {
        if let Some(entry) = self.registry.hosts.get(instance_id) {
            let timeout = self.supervisor.config().write_timeout;
            return matches!(
                tokio::time::timeout(timeout, entry.socket.ping()).await,
                Ok(Ok(()))
            );
        }
        match self.pubsub.probe(instance_id).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(host_instance_id = %instance_id, "Probe failed: {}", e);
                false
            }
        }
    }

    /// Check one candidate, promoting an Unreachable host that answers
    async fn try_host(&self, host: &HostInstanceDoc) -> Result<bool> {
        if !matches!(host.status, HostStatus::Online | HostStatus::Unreachable) {
            return Ok(false);
        }
        if !self.host_answers(&host.instance_id).await {
            debug!(host_instance_id = %host.instance_id, status = %host.status, "Candidate did not answer");
            return Ok(false);
        }
        if host.status == HostStatus::Unreachable {
            let promoted = self
                .store
                .update_host_instance_status(
                    &host.instance_id,
                    HostStatus::Online,
                    host.owner_epoch.as_deref(),
                )
                .await?;
            if promoted {
                info!(host_instance_id = %host.instance_id, "Unreachable host answered, promoted to online");
            }
        }
        Ok(true)
    }

    /// Find the page a client asked for within its organization.
    ///
    /// Page IDs are unique per API key only; when the same ID is declared
    /// under several keys of the organization, `api_key_id` must pick one.
    pub async fn resolve_page(
        &self,
        principal: &Principal,
        page_id: &str,
        api_key_id: Option<&str>,
    ) -> Result<PageDoc> {
        if page_id.trim().is_empty() {
            return Err(PorticoError::InvalidArgument("page_id must not be empty".into()));
        }

        let candidates: Vec<PageDoc> = match api_key_id {
            Some(api_key_id) => self
                .store
                .page(api_key_id, page_id)
                .await?
                .into_iter()
                .collect(),
            None => self.store.pages_by_id(page_id).await?,
        };
        if candidates.is_empty() {
            return Err(PorticoError::NotFound(format!("Page {}", page_id)));
        }

        let mut owned: Vec<PageDoc> = candidates
            .into_iter()
            .filter(|p| p.organization_id == principal.organization_id)
            .collect();
        match owned.len() {
            0 => Err(PorticoError::PermissionDenied(
                "Page belongs to another organization".into(),
            )),
            1 => Ok(owned.remove(0)),
            _ => Err(PorticoError::InvalidArgument(format!(
                "Page {} is declared under several API keys; api_key_id is required",
                page_id
            ))),
        }
    }

    /// First answering host for an API key, Online candidates before
    /// Unreachable ones
    pub async fn select_host(&self, api_key_id: &str) -> Result<String> {
        let hosts = self.store.host_instances(api_key_id).await?;
        let (online, unreachable): (Vec<_>, Vec<_>) = hosts
            .into_iter()
            .filter(|h| matches!(h.status, HostStatus::Online | HostStatus::Unreachable))
            .partition(|h| h.status == HostStatus::Online);

        for host in online.iter().chain(unreachable.iter()) {
            if self.try_host(host).await? {
                return Ok(host.instance_id.clone());
            }
        }

        Err(PorticoError::Unavailable(
            "No host instance is currently reachable".into(),
        ))
    }

    /// Resolve page and host, create or load the session, register the
    /// client, confirm, then tell the host. If telling the host fails the
    /// session is rolled back and the client deregistered.
    pub(super) async fn initialize_client(
        &self,
        conn: &mut Connection,
        id: &str,
        msg: InitializeClient,
    ) -> Result<()> {
        let socket = conn.socket.clone();
        let connection_id = conn.connection_id;
        let principal = conn.client_state("initialize_client")?.principal.clone();

        let page = self
            .resolve_page(&principal, &msg.page_id, msg.api_key_id.as_deref())
            .await?;

        let api_key = self
            .store
            .api_key(&page.api_key_id)
            .await?
            .ok_or_else(|| PorticoError::NotFound("API key".into()))?;
        principal.ensure_organization(&api_key.organization_id, "API key")?;

        let (session, created) = match msg.session_id.as_deref().filter(|s| !s.is_empty()) {
            None => {
                let host_instance_id = self.select_host(&api_key.api_key_id).await?;
                let session = SessionDoc::new(
                    Uuid::new_v4().to_string(),
                    principal.organization_id.clone(),
                    principal.user_id.clone(),
                    api_key.api_key_id.clone(),
                    page.page_id.clone(),
                    host_instance_id,
                );
                let mut tx = self.store.begin().await?;
                tx.insert_session(session.clone()).await?;
                tx.commit().await?;
                (session, true)
            }
            Some(session_id) => {
                let existing = self
                    .store
                    .session(session_id)
                    .await?
                    .ok_or_else(|| PorticoError::NotFound(format!("Session {}", session_id)))?;
                principal.ensure_organization(&existing.organization_id, "Session")?;
                if existing.page_id != page.page_id || existing.api_key_id != page.api_key_id {
                    return Err(PorticoError::InvalidArgument(format!(
                        "Session {} is bound to another page",
                        session_id
                    )));
                }

                let host = self
                    .store
                    .host_instance(&existing.host_instance_id)
                    .await?
                    .ok_or_else(|| PorticoError::Unavailable("Session host no longer exists".into()))?;
                if !self.try_host(&host).await? {
                    return Err(PorticoError::Unavailable(format!(
                        "Host instance {} is not reachable",
                        host.instance_id
                    )));
                }

                // Load inside a transaction so a concurrent close is observed
                let mut tx = self.store.begin().await?;
                let session = tx
                    .session(session_id)
                    .await?
                    .ok_or_else(|| PorticoError::NotFound(format!("Session {}", session_id)))?;
                tx.commit().await?;
                (session, false)
            }
        };

        let session_id = session.session_id.clone();
        let entry = ConnectionEntry::new(socket, connection_id);
        self.registry.clients.put(&session_id, entry.clone());
        self.supervisor.spawn_client(session_id.clone(), entry);
        conn.client_state("initialize_client")?
            .sessions
            .insert(session_id.clone());

        let notified = self.confirm_and_notify(conn, id, &session, &principal.user_id).await;
        if let Err(e) = notified {
            self.compensate(conn, &session_id, created).await;
            return Err(e);
        }

        info!(
            session_id = %session_id,
            host_instance_id = %session.host_instance_id,
            page_id = %session.page_id,
            created,
            "Client attached"
        );
        Ok(())
    }

    async fn confirm_and_notify(
        &self,
        conn: &Connection,
        id: &str,
        session: &SessionDoc,
        user_id: &str,
    ) -> Result<()> {
        conn.reply(Frame::new(
            id,
            Payload::InitializeClientCompleted(InitializeClientCompleted {
                session_id: session.session_id.clone(),
            }),
        ))
        .await?;

        let notification = Frame::new(
            id,
            Payload::InitializeClient(InitializeClient {
                page_id: session.page_id.clone(),
                api_key_id: Some(session.api_key_id.clone()),
                session_id: Some(session.session_id.clone()),
                user_id: Some(user_id.to_string()),
            }),
        )
        .encode()?;

        self.pubsub
            .publish(Channel::ToHost, &session.host_instance_id, notification)
            .await
    }

    /// Undo InitializeClient after the host could not be told
    async fn compensate(&self, conn: &mut Connection, session_id: &str, created: bool) {
        if created {
            let deleted = async {
                let mut tx = self.store.begin().await?;
                tx.delete_session(session_id).await?;
                tx.commit().await
            }
            .await;
            if let Err(e) = deleted {
                error!(
                    fault = "application",
                    session_id = %session_id,
                    "Failed to delete session during compensation: {}",
                    e
                );
            }
        }

        self.registry.clients.remove_if(session_id, conn.connection_id);
        if let Ok(state) = conn.client_state("initialize_client") {
            state.sessions.remove(session_id);
        }
        warn!(session_id = %session_id, created, "Host notification failed, client attachment rolled back");
    }

    /// Delete the session, tell its host, deregister the client. The host
    /// notification is best effort.
    pub(super) async fn close_session(
        &self,
        conn: &mut Connection,
        id: &str,
        msg: CloseSession,
    ) -> Result<()> {
        let principal = conn.client_state("close_session")?.principal.clone();

        let session = self
            .store
            .session(&msg.session_id)
            .await?
            .ok_or_else(|| PorticoError::NotFound(format!("Session {}", msg.session_id)))?;
        principal.ensure_organization(&session.organization_id, "Session")?;

        let mut tx = self.store.begin().await?;
        let deleted = tx.delete_session(&msg.session_id).await?;
        tx.commit().await?;
        if !deleted {
            return Err(PorticoError::NotFound(format!("Session {}", msg.session_id)));
        }

        let notification = Frame::new(id, Payload::CloseSession(msg.clone())).encode()?;
        if let Err(e) = self
            .pubsub
            .publish(Channel::ToHost, &session.host_instance_id, notification)
            .await
        {
            warn!(
                session_id = %msg.session_id,
                host_instance_id = %session.host_instance_id,
                "Failed to notify host of closed session: {}",
                e
            );
        }

        self.registry.clients.remove(&msg.session_id);
        conn.client_state("close_session")?
            .sessions
            .remove(&msg.session_id);

        info!(session_id = %msg.session_id, "Session closed");
        Ok(())
    }

    /// Forward a client-originated frame to the session's host after
    /// validating the session (and page, for RerunPage)
    pub(super) async fn relay_to_host(
        &self,
        conn: &mut Connection,
        kind: &str,
        session_id: &str,
        page_id: Option<&str>,
        raw: Bytes,
    ) -> Result<()> {
        let principal = &conn.client_state(kind)?.principal;

        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| PorticoError::NotFound(format!("Session {}", session_id)))?;
        principal.ensure_organization(&session.organization_id, "Session")?;

        if let Some(page_id) = page_id {
            let page = self
                .store
                .page(&session.api_key_id, page_id)
                .await?
                .ok_or_else(|| PorticoError::NotFound(format!("Page {}", page_id)))?;
            debug!(session_id = %session_id, page_id = %page.page_id, "Rerunning page");
        }

        let host = self
            .store
            .host_instance(&session.host_instance_id)
            .await?;
        match host {
            Some(host) if host.status != HostStatus::Offline => {}
            _ => {
                return Err(PorticoError::Unavailable(format!(
                    "Host instance {} for session {} is offline",
                    session.host_instance_id, session_id
                )))
            }
        }

        self.pubsub
            .publish(Channel::ToHost, &session.host_instance_id, raw)
            .await?;
        debug!(session_id = %session_id, kind, "Relayed to host");
        Ok(())
    }
}
