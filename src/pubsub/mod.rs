//! Cross-replica pub/sub transport
//!
//! Two logical channels, to-host and to-client. Every replica subscribes to
//! both and receives every envelope published by any replica; filtering by
//! target happens locally in the relay loops. There is no partitioning, no
//! acknowledgement and no retry: delivery is at-most-once broadcast. A
//! message whose target is not registered anywhere is simply lost.
//!
//! A third subject family, `<prefix>.probe.<host_instance_id>`, carries
//! request/reply liveness probes answered only by the replica that owns
//! the host's socket.

mod memory;
mod nats;

pub use memory::MemoryPubSub;
pub use nats::NatsPubSub;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::Result;

/// Logical pub/sub channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ToHost,
    ToClient,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToHost => "to_host",
            Self::ToClient => "to_client",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressed payload on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub target_id: String,
    /// Encoded protocol frame, forwarded to the socket untouched
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(target_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            target_id: target_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Where a probe answer goes
#[derive(Clone)]
enum ProbeReply {
    Nats {
        client: async_nats::Client,
        subject: async_nats::Subject,
    },
    Local(mpsc::Sender<bool>),
}

/// A liveness question about one host, received by the probe responder
#[derive(Clone)]
pub struct ProbeRequest {
    pub host_instance_id: String,
    reply: ProbeReply,
}

impl ProbeRequest {
    /// Answer the probe. Replicas that do not own the host never call this.
    pub async fn respond(self, alive: bool) {
        let result = match self.reply {
            ProbeReply::Nats { client, subject } => client
                .publish(subject, Bytes::from_static(if alive { b"1" } else { b"0" }))
                .await
                .map_err(|e| e.to_string()),
            ProbeReply::Local(tx) => tx.send(alive).await.map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            debug!(host_instance_id = %self.host_instance_id, "Probe reply dropped: {}", e);
        }
    }
}

/// Bus abstraction used by the handler, relay loops and probe responder
#[async_trait::async_trait]
pub trait PubSub: Send + Sync {
    /// Wrap `payload` in an envelope for `target_id` and publish it
    async fn publish(&self, channel: Channel, target_id: &str, payload: Bytes) -> Result<()>;

    /// Infinite stream of envelopes on `channel`. It ends only when the bus
    /// connection drops; restarting is the caller's job.
    async fn subscribe(&self, channel: Channel) -> Result<BoxStream<'static, Envelope>>;

    /// Ask the fleet whether a host's socket still answers pings. Returns
    /// false when no replica answers within the probe timeout.
    async fn probe(&self, host_instance_id: &str) -> Result<bool>;

    /// Stream of incoming probe requests for this replica to answer
    async fn serve_probes(&self) -> Result<BoxStream<'static, ProbeRequest>>;

    /// Flush buffered publishes
    async fn flush(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_payload_opaque() {
        let payload = Bytes::from_static(&[0xc1, 0x00, 0xff]);
        let envelope = Envelope::new("session-1", payload.clone());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.target_id, "session-1");
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::ToHost.to_string(), "to_host");
        assert_eq!(Channel::ToClient.as_str(), "to_client");
    }
}
