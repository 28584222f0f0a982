//! End-to-end broker flows against the in-memory store and bus

use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use portico::auth::Principal;
use portico::db::schemas::HostStatus;
use portico::handler::{Connection, ProtocolHandler};
use portico::liveness::{LivenessConfig, LivenessSupervisor};
use portico::protocol::{
    CloseSession, Frame, InitializeClient, InitializeHost, InitializeHostCompleted,
    PageDeclaration, Payload, RerunPage, ScriptFinished,
};
use portico::pubsub::{Channel, Envelope, MemoryPubSub, ProbeRequest, PubSub};
use portico::registry::{ConnectionRegistry, Socket};
use portico::relay::{Delivery, Relay};
use portico::store::{MemoryStore, Store};
use portico::{PorticoError, Result};

const API_KEY: &str = "pk_test_123";
const SECOND_KEY: &str = "pk_test_456";
const FOREIGN_KEY: &str = "pk_other_789";

#[derive(Default)]
struct TestSocket {
    frames: Mutex<Vec<Bytes>>,
    fail_pings: AtomicBool,
}

impl TestSocket {
    fn decoded(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|b| Frame::decode(b).unwrap())
            .collect()
    }

    fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl Socket for TestSocket {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_pings.load(Ordering::SeqCst) {
            Err(PorticoError::WebSocket("gone".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {}
}

/// Bus whose publishes always fail
struct BrokenBus(MemoryPubSub);

#[async_trait::async_trait]
impl PubSub for BrokenBus {
    async fn publish(&self, _: Channel, _: &str, _: Bytes) -> Result<()> {
        Err(PorticoError::Nats("bus down".into()))
    }

    async fn subscribe(&self, channel: Channel) -> Result<BoxStream<'static, Envelope>> {
        self.0.subscribe(channel).await
    }

    async fn probe(&self, host_instance_id: &str) -> Result<bool> {
        self.0.probe(host_instance_id).await
    }

    async fn serve_probes(&self) -> Result<BoxStream<'static, ProbeRequest>> {
        self.0.serve_probes().await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<ConnectionRegistry>,
    handler: ProtocolHandler,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

fn quiet_liveness() -> LivenessConfig {
    LivenessConfig {
        host_ping_interval: Duration::from_secs(3600),
        client_ping_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_api_key("key-1", "org-1", API_KEY).await;
    store.seed_api_key("key-2", "org-1", SECOND_KEY).await;
    store.seed_api_key("key-3", "org-2", FOREIGN_KEY).await;
    store
}

/// One broker replica over a store and bus that may be shared
fn replica(store: Arc<MemoryStore>, bus: Arc<dyn PubSub>, node_id: &str) -> Harness {
    let registry = Arc::new(ConnectionRegistry::new());
    let supervisor = Arc::new(LivenessSupervisor::new(
        quiet_liveness(),
        store.clone(),
        registry.clone(),
    ));
    let handler = ProtocolHandler::new(store.clone(), bus.clone(), registry.clone(), supervisor)
        .with_node_id(node_id);
    let relay = Arc::new(Relay::new(
        bus,
        registry.clone(),
        Duration::from_millis(10),
        Duration::from_secs(1),
    ));

    Harness {
        store,
        registry,
        handler,
        relay,
        shutdown: CancellationToken::new(),
    }
}

async fn harness_with(bus: Arc<dyn PubSub>) -> Harness {
    replica(seeded_store().await, bus, "node-a")
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryPubSub::new(Duration::from_millis(200)))).await
}

/// Two replicas sharing one store and one bus, relays running
async fn replica_pair() -> (Harness, Harness) {
    let store = seeded_store().await;
    let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new(Duration::from_millis(200)));
    let a = replica(store.clone(), bus.clone(), "node-a");
    let b = replica(store, bus, "node-b");
    a.start_relays().await;
    b.start_relays().await;
    (a, b)
}

impl Harness {
    async fn start_relays(&self) {
        self.relay.clone().spawn_all(self.shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn host_conn(&self, instance_id: &str) -> (Connection, Arc<TestSocket>) {
        let socket = Arc::new(TestSocket::default());
        let conn = Connection::host(self.registry.next_connection_id(), socket.clone(), instance_id);
        (conn, socket)
    }

    fn client_conn(&self, organization_id: &str) -> (Connection, Arc<TestSocket>) {
        let socket = Arc::new(TestSocket::default());
        let conn = Connection::client(
            self.registry.next_connection_id(),
            socket.clone(),
            Principal::new("user-1", organization_id),
        );
        (conn, socket)
    }

    async fn send(&self, conn: &mut Connection, id: &str, payload: Payload) {
        let raw = Frame::new(id, payload).encode().unwrap();
        self.handler.handle_frame(conn, raw).await;
    }

    async fn page_routes(&self) -> Vec<(String, String)> {
        let mut pages: Vec<(String, String)> = self
            .store
            .pages("key-1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.page_id, p.route))
            .collect();
        pages.sort();
        pages
    }
}

fn page(id: &str, route: &str) -> PageDeclaration {
    PageDeclaration {
        id: id.into(),
        name: id.to_uppercase(),
        route: route.into(),
        path: vec![0],
    }
}

fn init_host(pages: Vec<PageDeclaration>) -> Payload {
    init_host_with_key(API_KEY, pages)
}

fn init_host_with_key(api_key: &str, pages: Vec<PageDeclaration>) -> Payload {
    Payload::InitializeHost(InitializeHost {
        api_key: api_key.into(),
        sdk_name: "sdk-python".into(),
        sdk_version: "1.2.0".into(),
        pages,
    })
}

fn init_client(page_id: &str, session_id: Option<String>) -> Payload {
    Payload::InitializeClient(InitializeClient {
        page_id: page_id.into(),
        api_key_id: None,
        session_id,
        user_id: None,
    })
}

fn init_client_for_key(page_id: &str, api_key_id: &str) -> Payload {
    Payload::InitializeClient(InitializeClient {
        page_id: page_id.into(),
        api_key_id: Some(api_key_id.into()),
        session_id: None,
        user_id: None,
    })
}

fn exception_status(frame: &Frame) -> Option<u16> {
    match &frame.payload {
        Payload::Exception(e) => Some(e.status_code),
        _ => None,
    }
}

fn completed_session(frame: &Frame) -> String {
    match &frame.payload {
        Payload::InitializeClientCompleted(c) => c.session_id.clone(),
        other => panic!("expected InitializeClientCompleted, got {:?}", other),
    }
}

async fn wait_for_frames(socket: &TestSocket, count: usize) -> Vec<Frame> {
    for _ in 0..100 {
        let frames = socket.decoded();
        if frames.len() >= count {
            return frames;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    socket.decoded()
}

/// Host h1 online with pages p1 (/a) and p2 (/b)
async fn online_host(h: &Harness) -> (Connection, Arc<TestSocket>) {
    let (mut host, host_socket) = h.host_conn("h1");
    h.send(&mut host, "init", init_host(vec![page("p1", "/a"), page("p2", "/b")]))
        .await;
    host_socket.clear();
    (host, host_socket)
}

#[tokio::test]
async fn test_host_initialization_replies_and_registers() {
    let h = harness().await;
    let (mut host, socket) = h.host_conn("h1");

    h.send(&mut host, "init-1", init_host(vec![page("p1", "/a")])).await;

    let frames = socket.decoded();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, "init-1");
    assert_eq!(
        frames[0].payload,
        Payload::InitializeHostCompleted(InitializeHostCompleted {
            host_instance_id: "h1".into()
        })
    );
    assert!(h.registry.hosts.contains("h1"));

    let row = assert_ok!(h.store.host_instance("h1").await).unwrap();
    assert_eq!(row.status, HostStatus::Online);
    assert_eq!(row.sdk_name, "sdk-python");
    assert_eq!(row.organization_id, "org-1");
}

#[tokio::test]
async fn test_page_reconciliation_across_reconnects() {
    let h = harness().await;

    let (mut first, _) = h.host_conn("h1");
    h.send(&mut first, "a", init_host(vec![page("p1", "/a"), page("p2", "/b")]))
        .await;
    assert_eq!(
        h.page_routes().await,
        vec![("p1".into(), "/a".into()), ("p2".into(), "/b".into())]
    );

    let (mut second, _) = h.host_conn("h1");
    h.send(
        &mut second,
        "b",
        init_host(vec![page("p1", "/a-renamed"), page("p3", "/c")]),
    )
    .await;
    assert_eq!(
        h.page_routes().await,
        vec![
            ("p1".into(), "/a-renamed".into()),
            ("p3".into(), "/c".into())
        ]
    );
}

#[tokio::test]
async fn test_repeated_initialize_host_is_idempotent() {
    let h = harness().await;
    let (mut host, _) = h.host_conn("h1");
    let declared = vec![page("p1", "/a"), page("p2", "/b")];

    h.send(&mut host, "a", init_host(declared.clone())).await;
    let pages_before = h.store.pages("key-1").await.unwrap();
    let host_before = h.store.host_instance("h1").await.unwrap().unwrap();

    h.send(&mut host, "b", init_host(declared)).await;
    let mut pages_after = h.store.pages("key-1").await.unwrap();
    let host_after = h.store.host_instance("h1").await.unwrap().unwrap();

    let mut pages_before = pages_before;
    pages_before.sort_by(|a, b| a.page_id.cmp(&b.page_id));
    pages_after.sort_by(|a, b| a.page_id.cmp(&b.page_id));
    assert_eq!(pages_before, pages_after);
    assert_eq!(host_before.status, host_after.status);
    assert_eq!(host_before.status_changed_at, host_after.status_changed_at);
    assert_eq!(host_before.sdk_version, host_after.sdk_version);
    assert_eq!(h.registry.hosts.len(), 1);
}

#[tokio::test]
async fn test_unknown_api_key_is_not_found_and_nothing_registers() {
    let h = harness().await;
    let (mut host, socket) = h.host_conn("h1");

    h.send(
        &mut host,
        "bad",
        Payload::InitializeHost(InitializeHost {
            api_key: "pk_wrong".into(),
            sdk_name: "sdk".into(),
            sdk_version: "0".into(),
            pages: vec![page("p1", "/a")],
        }),
    )
    .await;

    let frames = socket.decoded();
    assert_eq!(frames[0].id, "bad");
    assert_eq!(exception_status(&frames[0]), Some(404));
    assert!(!h.registry.hosts.contains("h1"));
    assert!(h.store.host_instance("h1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_session_created_once_and_reused() {
    let h = harness().await;
    h.start_relays().await;
    let (_host, host_socket) = online_host(&h).await;

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;

    let frames = client_socket.decoded();
    assert_eq!(frames[0].id, "c1");
    let session_id = completed_session(&frames[0]);
    assert_eq!(h.store.session_count().await, 1);
    assert!(h.registry.clients.contains(&session_id));
    assert_eq!(h.registry.clients.len(), 1);

    // The host hears about the new session through the bus
    let host_frames = wait_for_frames(&host_socket, 1).await;
    match &host_frames[0].payload {
        Payload::InitializeClient(m) => {
            assert_eq!(m.session_id.as_deref(), Some(session_id.as_str()));
            assert_eq!(m.user_id.as_deref(), Some("user-1"));
            assert_eq!(m.page_id, "p1");
        }
        other => panic!("unexpected {:?}", other),
    }

    h.send(&mut client, "c2", init_client("p1", Some(session_id.clone())))
        .await;
    let frames = client_socket.decoded();
    assert_eq!(completed_session(&frames[1]), session_id);
    assert_eq!(h.store.session_count().await, 1);
    let session = h.store.session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.host_instance_id, "h1");

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_close_session_deletes_and_deregisters() {
    let h = harness().await;
    h.start_relays().await;
    let (_host, host_socket) = online_host(&h).await;

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;
    let session_id = completed_session(&client_socket.decoded()[0]);
    wait_for_frames(&host_socket, 1).await;

    h.send(
        &mut client,
        "close",
        Payload::CloseSession(CloseSession {
            session_id: session_id.clone(),
        }),
    )
    .await;

    assert!(h.store.session(&session_id).await.unwrap().is_none());
    assert!(!h.registry.clients.contains(&session_id));

    let host_frames = wait_for_frames(&host_socket, 2).await;
    assert!(matches!(host_frames[1].payload, Payload::CloseSession(_)));

    let late = Frame::new(
        "late",
        Payload::ScriptFinished(ScriptFinished {
            session_id: session_id.clone(),
            result: Bytes::new(),
        }),
    )
    .encode()
    .unwrap();
    assert_eq!(
        h.relay
            .relay_envelope(Channel::ToClient, Envelope::new(session_id.clone(), late))
            .await,
        Delivery::NotLocal
    );

    // A second close is a not-found
    client_socket.clear();
    h.send(
        &mut client,
        "again",
        Payload::CloseSession(CloseSession { session_id }),
    )
    .await;
    assert_eq!(exception_status(&client_socket.decoded()[0]), Some(404));

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_validated_relays_reach_the_paired_side() {
    let h = harness().await;
    h.start_relays().await;
    let (mut host, host_socket) = online_host(&h).await;

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;
    let session_id = completed_session(&client_socket.decoded()[0]);
    wait_for_frames(&host_socket, 1).await;
    host_socket.clear();
    client_socket.clear();

    let rerun = Frame::new(
        "rerun",
        Payload::RerunPage(RerunPage {
            session_id: session_id.clone(),
            page_id: "p1".into(),
            state: Bytes::from_static(b"\x01\x02"),
        }),
    );
    h.handler
        .handle_frame(&mut client, rerun.encode().unwrap())
        .await;
    let host_frames = wait_for_frames(&host_socket, 1).await;
    assert_eq!(host_frames[0], rerun);

    h.send(
        &mut host,
        "done",
        Payload::ScriptFinished(ScriptFinished {
            session_id: session_id.clone(),
            result: Bytes::from_static(b"ok"),
        }),
    )
    .await;
    let client_frames = wait_for_frames(&client_socket, 1).await;
    assert_eq!(client_frames[0].id, "done");
    assert!(matches!(client_frames[0].payload, Payload::ScriptFinished(_)));

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_failed_host_notification_rolls_back_session() {
    let h = harness_with(Arc::new(BrokenBus(MemoryPubSub::default()))).await;
    let (_host, _) = online_host(&h).await;

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;

    let frames = client_socket.decoded();
    assert_eq!(frames.len(), 2);
    let session_id = completed_session(&frames[0]);
    assert_eq!(frames[1].id, "c1");
    assert_eq!(exception_status(&frames[1]), Some(503));

    assert_eq!(h.store.session_count().await, 0);
    assert!(!h.registry.clients.contains(&session_id));
}

#[tokio::test]
async fn test_no_reachable_host_is_unavailable() {
    let h = harness().await;
    let (_host, host_socket) = online_host(&h).await;
    host_socket.fail_pings.store(true, Ordering::SeqCst);

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;

    assert_eq!(exception_status(&client_socket.decoded()[0]), Some(503));
    assert_eq!(h.store.session_count().await, 0);
}

#[tokio::test]
async fn test_unreachable_host_that_answers_is_promoted() {
    let h = harness().await;
    let (_host, _) = online_host(&h).await;
    assert_ok!(
        h.store
            .update_host_instance_status("h1", HostStatus::Unreachable, None)
            .await
    );

    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;

    completed_session(&client_socket.decoded()[0]);
    let row = h.store.host_instance("h1").await.unwrap().unwrap();
    assert_eq!(row.status, HostStatus::Online);
}

#[tokio::test]
async fn test_other_organization_is_denied() {
    let h = harness().await;
    let (_host, _) = online_host(&h).await;

    let (mut client, client_socket) = h.client_conn("org-2");
    h.send(&mut client, "c1", init_client("p1", None)).await;

    assert_eq!(exception_status(&client_socket.decoded()[0]), Some(403));
}

#[tokio::test]
async fn test_host_cannot_relay_for_foreign_session() {
    let h = harness().await;
    let (_host, _) = online_host(&h).await;
    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;
    let session_id = completed_session(&client_socket.decoded()[0]);

    let (mut other, other_socket) = h.host_conn("h2");
    h.send(&mut other, "init", init_host(vec![page("p1", "/a"), page("p2", "/b")]))
        .await;
    other_socket.clear();

    h.send(
        &mut other,
        "x",
        Payload::ScriptFinished(ScriptFinished {
            session_id,
            result: Bytes::new(),
        }),
    )
    .await;
    assert_eq!(exception_status(&other_socket.decoded()[0]), Some(403));
}

#[tokio::test]
async fn test_orphaned_session_fails_then_closes() {
    let h = harness().await;
    let (_host, _) = online_host(&h).await;
    let (mut client, client_socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("p1", None)).await;
    let session_id = completed_session(&client_socket.decoded()[0]);
    client_socket.clear();

    h.store
        .update_host_instance_status("h1", HostStatus::Offline, None)
        .await
        .unwrap();

    h.send(
        &mut client,
        "rerun",
        Payload::RerunPage(RerunPage {
            session_id: session_id.clone(),
            page_id: "p1".into(),
            state: Bytes::new(),
        }),
    )
    .await;
    assert_eq!(exception_status(&client_socket.decoded()[0]), Some(503));

    h.send(
        &mut client,
        "close",
        Payload::CloseSession(CloseSession {
            session_id: session_id.clone(),
        }),
    )
    .await;
    assert_eq!(client_socket.decoded().len(), 1);
    assert!(h.store.session(&session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_direction_rules() {
    let h = harness().await;
    let (mut host, host_socket) = online_host(&h).await;
    let (mut client, client_socket) = h.client_conn("org-1");

    h.send(&mut host, "x", init_client("p1", None)).await;
    assert_eq!(exception_status(&host_socket.decoded()[0]), Some(400));

    h.send(&mut client, "y", init_host(vec![])).await;
    assert_eq!(exception_status(&client_socket.decoded()[0]), Some(400));

    h.send(
        &mut client,
        "z",
        Payload::InitializeHostCompleted(InitializeHostCompleted {
            host_instance_id: "h1".into(),
        }),
    )
    .await;
    let frames = client_socket.decoded();
    assert_eq!(frames[1].id, "z");
    assert_eq!(exception_status(&frames[1]), Some(400));
}

#[tokio::test]
async fn test_garbage_frame_answered_with_exception() {
    let h = harness().await;
    let (mut client, socket) = h.client_conn("org-1");

    h.handler
        .handle_frame(&mut client, Bytes::from_static(b"\xc1\xc1"))
        .await;

    assert_eq!(exception_status(&socket.decoded()[0]), Some(400));
}

#[tokio::test]
async fn test_client_disconnect_deregisters_only_its_sessions() {
    let h = harness().await;
    let (_host, _) = online_host(&h).await;
    let (mut a, a_socket) = h.client_conn("org-1");
    let (mut b, b_socket) = h.client_conn("org-1");
    h.send(&mut a, "a", init_client("p1", None)).await;
    h.send(&mut b, "b", init_client("p2", None)).await;
    let sa = completed_session(&a_socket.decoded()[0]);
    let sb = completed_session(&b_socket.decoded()[0]);

    h.handler.disconnect(&mut a).await;

    assert!(!h.registry.clients.contains(&sa));
    assert!(h.registry.clients.contains(&sb));
    // Sessions survive a disconnect so the client can resume
    assert!(h.store.session(&sa).await.unwrap().is_some());
}

#[tokio::test]
async fn test_host_disconnect_marks_offline() {
    let h = harness().await;
    let (mut host, _) = online_host(&h).await;

    h.handler.disconnect(&mut host).await;

    assert!(!h.registry.hosts.contains("h1"));
    let row = assert_ok!(h.store.host_instance("h1").await).unwrap();
    assert_eq!(row.status, HostStatus::Offline);
}

#[tokio::test]
async fn test_host_and_client_on_different_replicas() {
    let (a, b) = replica_pair().await;
    let (mut host, host_socket) = online_host(&a).await;

    // Replica B has no local socket for h1, so selection goes over the bus
    let (mut client, client_socket) = b.client_conn("org-1");
    b.send(&mut client, "c1", init_client("p1", None)).await;
    let session_id = completed_session(&client_socket.decoded()[0]);
    assert!(!b.registry.hosts.contains("h1"));
    assert!(b.registry.clients.contains(&session_id));

    let host_frames = wait_for_frames(&host_socket, 1).await;
    match &host_frames[0].payload {
        Payload::InitializeClient(m) => {
            assert_eq!(m.session_id.as_deref(), Some(session_id.as_str()));
            assert_eq!(m.api_key_id.as_deref(), Some("key-1"));
        }
        other => panic!("unexpected {:?}", other),
    }
    host_socket.clear();
    client_socket.clear();

    a.send(
        &mut host,
        "done",
        Payload::ScriptFinished(ScriptFinished {
            session_id: session_id.clone(),
            result: Bytes::from_static(b"ok"),
        }),
    )
    .await;
    let client_frames = wait_for_frames(&client_socket, 1).await;
    assert_eq!(client_frames[0].id, "done");

    let rerun = Frame::new(
        "rerun",
        Payload::RerunPage(RerunPage {
            session_id,
            page_id: "p1".into(),
            state: Bytes::new(),
        }),
    );
    b.handler
        .handle_frame(&mut client, rerun.encode().unwrap())
        .await;
    assert_eq!(wait_for_frames(&host_socket, 1).await, vec![rerun]);

    a.shutdown.cancel();
    b.shutdown.cancel();
}

#[tokio::test]
async fn test_stale_replica_disconnect_keeps_host_online() {
    let (a, b) = replica_pair().await;
    let (mut old_host, _) = online_host(&a).await;

    // The host reconnects through replica B before A notices the old socket died
    let (mut new_host, new_socket) = b.host_conn("h1");
    b.send(&mut new_host, "init", init_host(vec![page("p1", "/a")]))
        .await;
    assert!(matches!(
        new_socket.decoded()[0].payload,
        Payload::InitializeHostCompleted(_)
    ));

    a.handler.disconnect(&mut old_host).await;
    assert!(!a.registry.hosts.contains("h1"));
    let row = b.store.host_instance("h1").await.unwrap().unwrap();
    assert_eq!(row.status, HostStatus::Online);

    let (mut client, client_socket) = b.client_conn("org-1");
    b.send(&mut client, "c1", init_client("p1", None)).await;
    completed_session(&client_socket.decoded()[0]);

    // The live connection still owns the row and can take it offline
    b.handler.disconnect(&mut new_host).await;
    let row = b.store.host_instance("h1").await.unwrap().unwrap();
    assert_eq!(row.status, HostStatus::Offline);

    a.shutdown.cancel();
    b.shutdown.cancel();
}

#[tokio::test]
async fn test_same_page_id_under_different_keys() {
    let h = harness().await;
    let (mut own, _) = h.host_conn("h1");
    h.send(&mut own, "i1", init_host(vec![page("home", "/")])).await;
    let (mut foreign, _) = h.host_conn("h3");
    h.send(
        &mut foreign,
        "i3",
        init_host_with_key(FOREIGN_KEY, vec![page("home", "/")]),
    )
    .await;

    // Declaring under key-3 must not take the page away from key-1
    assert_eq!(h.store.pages("key-1").await.unwrap().len(), 1);
    assert_eq!(h.store.pages("key-3").await.unwrap().len(), 1);

    let (mut c1, s1) = h.client_conn("org-1");
    h.send(&mut c1, "c1", init_client("home", None)).await;
    let session = completed_session(&s1.decoded()[0]);
    assert_eq!(
        h.store.session(&session).await.unwrap().unwrap().host_instance_id,
        "h1"
    );

    let (mut c2, s2) = h.client_conn("org-2");
    h.send(&mut c2, "c2", init_client("home", None)).await;
    let session = completed_session(&s2.decoded()[0]);
    assert_eq!(
        h.store.session(&session).await.unwrap().unwrap().host_instance_id,
        "h3"
    );
}

#[tokio::test]
async fn test_ambiguous_page_needs_api_key_id() {
    let h = harness().await;
    let (mut first, _) = h.host_conn("h1");
    h.send(&mut first, "i1", init_host(vec![page("home", "/")])).await;
    let (mut second, _) = h.host_conn("h2");
    h.send(
        &mut second,
        "i2",
        init_host_with_key(SECOND_KEY, vec![page("home", "/")]),
    )
    .await;

    let (mut client, socket) = h.client_conn("org-1");
    h.send(&mut client, "c1", init_client("home", None)).await;
    assert_eq!(exception_status(&socket.decoded()[0]), Some(400));

    h.send(&mut client, "c2", init_client_for_key("home", "key-2")).await;
    let session = completed_session(&socket.decoded()[1]);
    let row = h.store.session(&session).await.unwrap().unwrap();
    assert_eq!(row.host_instance_id, "h2");
    assert_eq!(row.api_key_id, "key-2");

    // A key that never declared the page does not match
    h.send(&mut client, "c3", init_client_for_key("home", "key-3")).await;
    assert_eq!(exception_status(&socket.decoded()[2]), Some(404));
}
