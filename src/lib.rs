//! Portico - connection broker between customer hosts and browser clients
//!
//! Hosts (customer backend processes) connect outbound and declare the pages
//! they serve; browser clients attach to a page and get a session bound to
//! one reachable host. Portico relays protocol frames between the two, even
//! when they are connected to different replicas.
//!
//! ## Components
//!
//! - **Registry**: which logical IDs have a socket on this replica
//! - **PubSub**: broadcast bus between replicas (NATS, or in-memory)
//! - **Relay**: drains the bus and writes to local sockets
//! - **Liveness**: per-connection ping supervision and host status
//! - **Handler**: InitializeHost/InitializeClient/CloseSession and validated relays
//! - **Server**: HTTP surface and the socket entry point

pub mod auth;
pub mod config;
pub mod db;
pub mod handler;
pub mod liveness;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod server;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{PorticoError, Result};
