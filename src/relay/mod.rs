//! Relay loops and the probe responder
//!
//! Two process-wide tasks drain the to-host and to-client subscriptions. For
//! each envelope the target is looked up in the local registry; if present
//! the raw payload is handed to that entry's outbound queue, otherwise it is
//! dropped. The loops never wait on a socket write, so one slow target cannot
//! stall delivery to the others. There is no retry here; a full queue drops
//! the frame.
//!
//! A third task answers cross-replica liveness probes for hosts whose socket
//! lives on this replica.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::Frame;
use crate::pubsub::{Channel, Envelope, ProbeRequest, PubSub};
use crate::registry::{ConnectionMap, ConnectionRegistry};

/// Outcome of relaying one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Target not registered on this replica
    NotLocal,
    /// Payload was not a protocol frame
    Malformed,
    /// Target found but its outbound queue is full or closed
    WriteFailed,
}

pub struct Relay {
    pubsub: Arc<dyn PubSub>,
    registry: Arc<ConnectionRegistry>,
    restart_delay: Duration,
    ping_timeout: Duration,
}

impl Relay {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        registry: Arc<ConnectionRegistry>,
        restart_delay: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            pubsub,
            registry,
            restart_delay,
            ping_timeout,
        }
    }

    /// Spawn both relay loops and the probe responder
    pub fn spawn_all(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(3);
        for channel in [Channel::ToHost, Channel::ToClient] {
            let relay = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { relay.run(channel, shutdown).await }));
        }
        let relay = Arc::clone(&self);
        tasks.push(tokio::spawn(async move { relay.run_probe_responder(shutdown).await }));
        tasks
    }

    fn map(&self, channel: Channel) -> &ConnectionMap {
        match channel {
            Channel::ToHost => &self.registry.hosts,
            Channel::ToClient => &self.registry.clients,
        }
    }

    /// Forward one envelope to its local target, if any
    pub async fn relay_envelope(&self, channel: Channel, envelope: Envelope) -> Delivery {
        let frame = match Frame::decode(&envelope.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %channel, target_id = %envelope.target_id, "Dropping envelope: {}", e);
                return Delivery::Malformed;
            }
        };

        let Some(entry) = self.map(channel).get(&envelope.target_id) else {
            debug!(
                channel = %channel,
                target_id = %envelope.target_id,
                kind = frame.kind(),
                "Target not registered here, dropping"
            );
            return Delivery::NotLocal;
        };

        match entry.enqueue(envelope.payload) {
            Ok(()) => {
                debug!(channel = %channel, target_id = %envelope.target_id, kind = frame.kind(), "Relayed");
                Delivery::Delivered
            }
            Err(e) => {
                warn!(channel = %channel, target_id = %envelope.target_id, "Relay write failed: {}", e);
                Delivery::WriteFailed
            }
        }
    }

    /// Drain one channel until shutdown, re-subscribing when the stream ends
    pub async fn run(&self, channel: Channel, shutdown: CancellationToken) {
        loop {
            match self.pubsub.subscribe(channel).await {
                Ok(mut stream) => {
                    info!(channel = %channel, "Relay loop subscribed");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!(channel = %channel, "Relay loop stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(envelope) => {
                                    self.relay_envelope(channel, envelope).await;
                                }
                                None => break,
                            }
                        }
                    }
                    warn!(channel = %channel, "Relay subscription ended");
                }
                Err(e) => error!(fault = "application", channel = %channel, "Relay subscribe failed: {}", e),
            }

            if !self.wait_before_restart(&shutdown).await {
                return;
            }
        }
    }

    async fn answer_probe(&self, request: ProbeRequest) {
        let Some(entry) = self.registry.hosts.get(&request.host_instance_id) else {
            // Another replica may own it; stay silent
            return;
        };
        let ping_timeout = self.ping_timeout;
        tokio::spawn(async move {
            let alive = matches!(
                tokio::time::timeout(ping_timeout, entry.socket.ping()).await,
                Ok(Ok(()))
            );
            debug!(host_instance_id = %request.host_instance_id, alive, "Answering probe");
            request.respond(alive).await;
        });
    }

    /// Answer probes for locally registered hosts until shutdown
    pub async fn run_probe_responder(&self, shutdown: CancellationToken) {
        loop {
            match self.pubsub.serve_probes().await {
                Ok(mut stream) => {
                    info!("Probe responder subscribed");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!("Probe responder stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(request) => self.answer_probe(request).await,
                                None => break,
                            }
                        }
                    }
                    warn!("Probe subscription ended");
                }
                Err(e) => error!(fault = "application", "Probe subscribe failed: {}", e),
            }

            if !self.wait_before_restart(&shutdown).await {
                return;
            }
        }
    }

    /// Returns false if shutdown fired during the delay
    async fn wait_before_restart(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.restart_delay) => {
                info!("Restarting subscription after {:?}", self.restart_delay);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CloseSession, Payload};
    use crate::pubsub::MemoryPubSub;
    use crate::registry::tests::RecordingSocket;
    use crate::registry::ConnectionEntry;
    use bytes::Bytes;

    fn relay(registry: Arc<ConnectionRegistry>, bus: Arc<MemoryPubSub>) -> Arc<Relay> {
        Arc::new(Relay::new(
            bus,
            registry,
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))
    }

    fn close_frame(session_id: &str) -> Bytes {
        Frame::new(
            "m1",
            Payload::CloseSession(CloseSession {
                session_id: session_id.into(),
            }),
        )
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_unregistered_target_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = relay(registry, Arc::new(MemoryPubSub::default()));

        let delivery = relay
            .relay_envelope(Channel::ToHost, Envelope::new("random-id", close_frame("s")))
            .await;
        assert_eq!(delivery, Delivery::NotLocal);
    }

    #[tokio::test]
    async fn test_registered_target_gets_raw_payload() {
        let registry = Arc::new(ConnectionRegistry::new());
        let socket = Arc::new(RecordingSocket::default());
        registry
            .clients
            .put("s1", ConnectionEntry::new(socket.clone(), 1));
        let relay = relay(registry, Arc::new(MemoryPubSub::default()));

        let payload = close_frame("s1");
        let delivery = relay
            .relay_envelope(Channel::ToClient, Envelope::new("s1", payload.clone()))
            .await;

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(socket.wait_for_frames(1).await, vec![payload]);
    }

    #[tokio::test]
    async fn test_stalled_target_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        registry.clients.put(
            "slow",
            ConnectionEntry::new(Arc::new(RecordingSocket::stalled(gate.clone())), 1),
        );
        let fast = Arc::new(RecordingSocket::default());
        registry
            .clients
            .put("fast", ConnectionEntry::new(fast.clone(), 2));
        let relay = relay(registry, Arc::new(MemoryPubSub::default()));

        let mut outcomes = Vec::new();
        for _ in 0..=crate::registry::OUTBOUND_QUEUE_CAPACITY + 1 {
            let delivery = tokio::time::timeout(
                Duration::from_secs(1),
                relay.relay_envelope(Channel::ToClient, Envelope::new("slow", close_frame("slow"))),
            )
            .await
            .expect("relay waited on a stalled socket");
            outcomes.push(delivery);
            tokio::task::yield_now().await;
        }
        assert_eq!(outcomes.last(), Some(&Delivery::WriteFailed));

        let payload = close_frame("fast");
        let delivery = relay
            .relay_envelope(Channel::ToClient, Envelope::new("fast", payload.clone()))
            .await;
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(fast.wait_for_frames(1).await, vec![payload]);
        gate.close();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = relay(registry, Arc::new(MemoryPubSub::default()));
        let delivery = relay
            .relay_envelope(Channel::ToClient, Envelope::new("s1", Bytes::from_static(b"\xc1")))
            .await;
        assert_eq!(delivery, Delivery::Malformed);
    }

    #[tokio::test]
    async fn test_probe_answered_only_for_local_hosts() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.hosts.put(
            "local",
            ConnectionEntry::new(Arc::new(RecordingSocket::default()), 1),
        );
        let bus = Arc::new(MemoryPubSub::new(Duration::from_millis(200)));
        let shutdown = CancellationToken::new();
        let tasks = relay(registry, bus.clone()).spawn_all(shutdown.clone());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(bus.probe("local").await.unwrap());
        assert!(!bus.probe("remote").await.unwrap());

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
