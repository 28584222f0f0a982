//! NATS-backed transport
//!
//! Subjects: `<prefix>.to_host`, `<prefix>.to_client` and
//! `<prefix>.probe.<host_instance_id>`. Core NATS is used rather than
//! JetStream: nothing is persisted and late subscribers see nothing.

use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{info, warn};

use super::{Channel, Envelope, ProbeReply, ProbeRequest, PubSub};
use crate::config::NatsArgs;
use crate::types::{PorticoError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct NatsPubSub {
    client: Client,
    prefix: String,
    probe_timeout: Duration,
}

impl NatsPubSub {
    /// Connect to NATS
    pub async fn connect(
        args: &NatsArgs,
        name: &str,
        prefix: &str,
        probe_timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        // No retry on initial connect; dev mode falls back to the in-memory bus
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| PorticoError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            probe_timeout,
        })
    }

    fn channel_subject(&self, channel: Channel) -> String {
        format!("{}.{}", self.prefix, channel.as_str())
    }

    fn probe_subject(&self, host_instance_id: &str) -> String {
        format!("{}.probe.{}", self.prefix, host_instance_id)
    }
}

#[async_trait::async_trait]
impl PubSub for NatsPubSub {
    async fn publish(&self, channel: Channel, target_id: &str, payload: Bytes) -> Result<()> {
        let envelope = Envelope::new(target_id, payload).encode()?;
        self.client
            .publish(self.channel_subject(channel), envelope)
            .await
            .map_err(|e| PorticoError::Nats(format!("Publish failed: {}", e)))
    }

    async fn subscribe(&self, channel: Channel) -> Result<BoxStream<'static, Envelope>> {
        let subscriber = self
            .client
            .subscribe(self.channel_subject(channel))
            .await
            .map_err(|e| PorticoError::Nats(format!("Subscribe failed: {}", e)))?;

        Ok(subscriber
            .filter_map(move |message| async move {
                match Envelope::decode(&message.payload) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        warn!(channel = %channel, "Dropping undecodable envelope: {}", e);
                        None
                    }
                }
            })
            .boxed())
    }

    async fn probe(&self, host_instance_id: &str) -> Result<bool> {
        let request = self
            .client
            .request(self.probe_subject(host_instance_id), Bytes::new());

        match tokio::time::timeout(self.probe_timeout, request).await {
            Ok(Ok(reply)) => Ok(reply.payload.as_ref() == b"1"),
            // No responders or a dropped request both mean nobody owns it
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    async fn serve_probes(&self) -> Result<BoxStream<'static, ProbeRequest>> {
        let subscriber = self
            .client
            .subscribe(format!("{}.probe.*", self.prefix))
            .await
            .map_err(|e| PorticoError::Nats(format!("Subscribe failed: {}", e)))?;

        let client = self.client.clone();
        let prefix = format!("{}.probe.", self.prefix);

        Ok(subscriber
            .filter_map(move |message| {
                let client = client.clone();
                let prefix = prefix.clone();
                async move {
                    let reply = message.reply?;
                    let host_instance_id = message.subject.strip_prefix(prefix.as_str())?.to_string();
                    Some(ProbeRequest {
                        host_instance_id,
                        reply: ProbeReply::Nats {
                            client,
                            subject: reply,
                        },
                    })
                }
            })
            .boxed())
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| PorticoError::Nats(format!("Flush failed: {}", e)))
    }
}
