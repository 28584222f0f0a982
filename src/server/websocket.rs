//! WebSocket upgrade and connection handling
//!
//! Hosts connect to `/ws/host` with an `X-Instance-ID` header naming the
//! host instance; clients connect to `/ws/client` with a bearer token (or
//! dev-mode principal headers). After the upgrade each socket gets one read
//! loop that feeds binary frames to the protocol handler in arrival order.
//!
//! The read side enforces the pong deadline: if nothing at all arrives
//! within it (pongs included), the socket is considered dead.

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_tungstenite::WebSocketStream;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::auth::Principal;
use crate::handler::Connection;
use crate::registry::Socket;
use crate::server::http::{error_response, AppState};
use crate::types::{PorticoError, Result};

/// Header carrying the host instance ID on `/ws/host`
pub const INSTANCE_ID_HEADER: &str = "x-instance-id";

/// Type alias for the WebSocket write half
pub type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TokioIo<Upgraded>>, Message>>>;

/// [`Socket`] over the write half of an upgraded connection
pub struct WsSocket {
    sink: WsSink,
    write_timeout: Duration,
}

impl WsSocket {
    pub fn new(sink: WsSink, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }

    async fn write(&self, message: Message) -> Result<()> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| PorticoError::WebSocket("Write deadline exceeded".into()))?
            .map_err(PorticoError::from)
    }
}

#[async_trait::async_trait]
impl Socket for WsSocket {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.write(Message::Binary(frame.to_vec())).await
    }

    async fn ping(&self) -> Result<()> {
        self.write(Message::Ping(Vec::new())).await
    }

    async fn close(&self) {
        let _ = self.write(Message::Close(None)).await;
    }
}

/// Host instance IDs become NATS subject tokens, so keep them to a safe alphabet
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    let valid = !instance_id.is_empty()
        && instance_id.len() <= 128
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PorticoError::InvalidArgument(
            "X-Instance-ID must be 1-128 characters of [A-Za-z0-9_-]".into(),
        ))
    }
}

/// Handle WebSocket upgrade for a host
pub async fn handle_host_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let instance_id = req
        .headers()
        .get(INSTANCE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string();

    if let Err(e) = validate_instance_id(&instance_id) {
        warn!("Host upgrade rejected: {}", e);
        return error_response(e);
    }

    info!(host_instance_id = %instance_id, "Host WebSocket upgrade request");
    upgrade(state, req, Peer::Host(instance_id))
}

/// Handle WebSocket upgrade for a browser client
pub async fn handle_client_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let principal = match state.auth.authenticate(req.headers(), req.uri()) {
        Ok(principal) => principal,
        Err(e) => {
            warn!("Client WebSocket auth failed: {}", e);
            return error_response(e);
        }
    };

    info!(user_id = %principal.user_id, organization_id = %principal.organization_id, "Client WebSocket upgrade request");
    upgrade(state, req, Peer::Client(principal))
}

enum Peer {
    Host(String),
    Client(Principal),
}

fn upgrade(state: Arc<AppState>, req: Request<Incoming>, peer: Peer) -> Response<Full<Bytes>> {
    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => serve_socket(state, ws, peer).await,
                    Err(e) => error!("WebSocket upgrade failed: {:?}", e),
                }
            });

            // Convert the upgrade response
            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("WebSocket upgrade error: {:?}", e);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {e}"
                ))))
                .unwrap()
        }
    }
}

/// Read loop for one upgraded socket
async fn serve_socket(state: Arc<AppState>, ws: WebSocketStream<TokioIo<Upgraded>>, peer: Peer) {
    let liveness = state.args.liveness_config();
    let (sink, mut stream) = ws.split();
    let socket: Arc<dyn Socket> = Arc::new(WsSocket::new(
        Arc::new(Mutex::new(sink)),
        liveness.write_timeout,
    ));

    let connection_id = state.registry.next_connection_id();
    let (mut conn, read_deadline) = match peer {
        Peer::Host(instance_id) => (
            Connection::host(connection_id, Arc::clone(&socket), instance_id),
            liveness.host_pong_timeout,
        ),
        Peer::Client(principal) => (
            Connection::client(connection_id, Arc::clone(&socket), principal),
            liveness.client_pong_timeout,
        ),
    };

    debug!(connection_id, host = conn.is_host(), "Socket opened");

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = tokio::time::timeout(read_deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!(connection_id, "Read deadline exceeded, closing socket");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id, "Socket read error: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => {
                state
                    .handler
                    .handle_frame(&mut conn, Bytes::from(data))
                    .await
            }
            Message::Text(_) => {
                state
                    .handler
                    .reject(
                        &conn,
                        PorticoError::InvalidArgument("Frames must be binary MessagePack".into()),
                    )
                    .await
            }
            Message::Close(_) => break,
            // Pings are answered by tungstenite; pongs only refresh the deadline
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    state.handler.disconnect(&mut conn).await;
    socket.close().await;
    debug!(connection_id, "Socket closed");
}
