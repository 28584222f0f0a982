//! Host-side operations: InitializeHost and host-originated relays

use bytes::Bytes;
use tracing::{debug, info};

use super::pages::{reconcile_pages, validate_declarations};
use super::{Connection, HostBinding, ProtocolHandler};
use crate::db::schemas::{HostInstanceDoc, HostStatus};
use crate::protocol::{Frame, InitializeHost, InitializeHostCompleted, Payload};
use crate::pubsub::Channel;
use crate::registry::ConnectionEntry;
use crate::types::{PorticoError, Result};

impl ProtocolHandler {
    /// Authenticate the host, upsert its row and reconcile its pages in one
    /// transaction, then register it and reply.
    ///
    /// Registration happens strictly after commit: the host is never routable
    /// before its state is durable. The row is stamped with this connection's
    /// owner epoch so that teardown of an older connection, on any replica,
    /// cannot overwrite the status.
    pub(super) async fn initialize_host(
        &self,
        conn: &mut Connection,
        id: &str,
        msg: InitializeHost,
    ) -> Result<()> {
        let socket = conn.socket.clone();
        let connection_id = conn.connection_id;
        let owner_epoch = self.owner_epoch(connection_id);
        let state = conn.host_state("initialize_host")?;
        let instance_id = state.instance_id.clone();

        validate_declarations(&msg.pages)?;

        let api_key = self
            .store
            .api_key_by_key(&msg.api_key)
            .await?
            .ok_or_else(|| PorticoError::NotFound("API key".into()))?;

        let mut tx = self.store.begin().await?;

        match tx.host_instance(&instance_id).await? {
            Some(mut host) => {
                if host.organization_id != api_key.organization_id {
                    return Err(PorticoError::PermissionDenied(format!(
                        "Host instance {} belongs to another organization",
                        instance_id
                    )));
                }
                host.api_key_id = api_key.api_key_id.clone();
                host.sdk_name = msg.sdk_name.clone();
                host.sdk_version = msg.sdk_version.clone();
                host.owner_epoch = Some(owner_epoch.clone());
                host.set_status(HostStatus::Online);
                tx.update_host_instance(host).await?;
            }
            None => {
                let mut host = HostInstanceDoc::new(
                    instance_id.clone(),
                    api_key.organization_id.clone(),
                    api_key.api_key_id.clone(),
                );
                host.sdk_name = msg.sdk_name.clone();
                host.sdk_version = msg.sdk_version.clone();
                host.owner_epoch = Some(owner_epoch.clone());
                host.set_status(HostStatus::Online);
                tx.insert_host_instance(host).await?;
            }
        }

        let existing = tx.pages(&api_key.api_key_id).await?;
        let plan = reconcile_pages(&api_key, &msg.pages, &existing);
        debug!(
            host_instance_id = %instance_id,
            insert = plan.insert.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            "Reconciling pages"
        );
        tx.insert_pages(plan.insert).await?;
        tx.update_pages(plan.update).await?;
        tx.delete_pages(&api_key.api_key_id, plan.delete).await?;
        tx.commit().await?;

        let entry = ConnectionEntry::new(socket, connection_id);
        self.registry.hosts.put(&instance_id, entry.clone());
        self.supervisor
            .spawn_host(instance_id.clone(), owner_epoch.clone(), entry);

        state.binding = Some(HostBinding {
            api_key_id: api_key.api_key_id.clone(),
            organization_id: api_key.organization_id.clone(),
            owner_epoch,
        });

        info!(
            host_instance_id = %instance_id,
            api_key_id = %api_key.api_key_id,
            sdk = %format!("{}/{}", msg.sdk_name, msg.sdk_version),
            pages = msg.pages.len(),
            "Host initialized"
        );

        conn.reply(Frame::new(
            id,
            Payload::InitializeHostCompleted(InitializeHostCompleted {
                host_instance_id: instance_id,
            }),
        ))
        .await
    }

    /// Forward a host-originated frame to the session's client after
    /// checking the session belongs to this host
    pub(super) async fn relay_to_client(
        &self,
        conn: &mut Connection,
        kind: &str,
        session_id: &str,
        raw: Bytes,
    ) -> Result<()> {
        let state = conn.host_state(kind)?;
        if state.binding.is_none() {
            return Err(PorticoError::InvalidArgument(
                "InitializeHost must complete first".into(),
            ));
        }

        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| PorticoError::NotFound(format!("Session {}", session_id)))?;

        if session.host_instance_id != state.instance_id {
            return Err(PorticoError::PermissionDenied(format!(
                "Session {} is not served by this host",
                session_id
            )));
        }

        self.pubsub
            .publish(Channel::ToClient, session_id, raw)
            .await?;
        debug!(session_id = %session_id, kind, "Relayed to client");
        Ok(())
    }
}
