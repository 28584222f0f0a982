//! Single-process transport over tokio broadcast channels
//!
//! Same broadcast and at-most-once semantics as NATS, minus the network.
//! Used in dev mode and tests.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::{Channel, Envelope, ProbeReply, ProbeRequest, PubSub};
use crate::types::Result;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryPubSub {
    to_host: broadcast::Sender<Envelope>,
    to_client: broadcast::Sender<Envelope>,
    probes: broadcast::Sender<ProbeRequest>,
    probe_timeout: Duration,
}

impl MemoryPubSub {
    pub fn new(probe_timeout: Duration) -> Self {
        let (to_host, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (to_client, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (probes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            to_host,
            to_client,
            probes,
            probe_timeout,
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Envelope> {
        match channel {
            Channel::ToHost => &self.to_host,
            Channel::ToClient => &self.to_client,
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait::async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: Channel, target_id: &str, payload: Bytes) -> Result<()> {
        // No subscribers means nobody can deliver it: dropped, not an error
        let _ = self.sender(channel).send(Envelope::new(target_id, payload));
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<BoxStream<'static, Envelope>> {
        let receiver = self.sender(channel).subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(move |item| async move {
                match item {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        warn!(channel = %channel, "Relay subscriber lagged: {}", e);
                        None
                    }
                }
            })
            .boxed())
    }

    async fn probe(&self, host_instance_id: &str) -> Result<bool> {
        let (tx, mut rx) = mpsc::channel(1);
        let request = ProbeRequest {
            host_instance_id: host_instance_id.to_string(),
            reply: ProbeReply::Local(tx),
        };
        if self.probes.send(request).is_err() {
            return Ok(false);
        }
        match tokio::time::timeout(self.probe_timeout, rx.recv()).await {
            Ok(Some(alive)) => Ok(alive),
            Ok(None) | Err(_) => Ok(false),
        }
    }

    async fn serve_probes(&self) -> Result<BoxStream<'static, ProbeRequest>> {
        let receiver = self.probes.subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
