//! HTTP server implementation
//!
//! hyper http1 with TokioIo; socket routes are upgraded in place.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::Args;
use crate::handler::ProtocolHandler;
use crate::liveness::LivenessSupervisor;
use crate::pubsub::PubSub;
use crate::registry::ConnectionRegistry;
use crate::routes;
use crate::server::websocket;
use crate::store::Store;
use crate::types::{PorticoError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn Store>,
    pub pubsub: Arc<dyn PubSub>,
    pub registry: Arc<ConnectionRegistry>,
    pub handler: Arc<ProtocolHandler>,
    pub auth: Authenticator,
    /// Backend names reported by /health
    pub store_backend: &'static str,
    pub bus_backend: &'static str,
    /// Fires on process shutdown; read loops exit when it does
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the registry, supervisor and handler around the given backends
    pub fn new(
        args: Args,
        store: Arc<dyn Store>,
        store_backend: &'static str,
        pubsub: Arc<dyn PubSub>,
        bus_backend: &'static str,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor = Arc::new(LivenessSupervisor::new(
            args.liveness_config(),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));
        let handler = Arc::new(
            ProtocolHandler::new(
                Arc::clone(&store),
                Arc::clone(&pubsub),
                Arc::clone(&registry),
                supervisor,
            )
            .with_node_id(args.node_id.to_string())
            .with_exposed_stacks(args.expose_error_stacks),
        );
        let auth = Authenticator::new(args.jwt_secret.clone(), args.dev_mode);

        Self {
            args,
            store,
            pubsub,
            registry,
            handler,
            auth,
            store_backend,
            bus_backend,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

/// Accept connections until shutdown
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Portico listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - header principals accepted");
    }

    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),

        (Method::GET, "/version") => routes::version_info(),

        (Method::GET, "/api/hosts/ping") => routes::host_ping(&state, req.headers(), req.uri()).await,

        (Method::GET, "/ws/host") => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                websocket::handle_host_upgrade(state, req).await
            } else {
                bad_request_response("Host endpoint requires WebSocket upgrade")
            }
        }

        (Method::GET, "/ws/client") => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                websocket::handle_client_upgrade(state, req).await
            } else {
                bad_request_response("Client endpoint requires WebSocket upgrade")
            }
        }

        (Method::OPTIONS, _) => preflight_response(),

        _ => not_found_response(&path),
    };

    Ok(response)
}

/// JSON response with the error's status class
pub fn error_response(err: PorticoError) -> Response<Full<Bytes>> {
    let (status, body) = err.into_status_code_and_body();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// JSON 200 response
pub fn json_response<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(PorticoError::Serialization(e.to_string())),
    }
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "Hosts connect to /ws/host, clients to /ws/client"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Bad request response
pub fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Bad Request",
        "message": message
    });

    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
