//! Configuration for portico
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::liveness::LivenessConfig;

/// Portico - connection broker between customer hosts and browser clients
#[derive(Parser, Debug, Clone)]
#[command(name = "portico")]
#[command(about = "Relays session traffic between customer-operated hosts and browser clients")]
pub struct Args {
    /// Unique node identifier for this replica
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (header principals, in-memory fallbacks)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// MongoDB connection URI (must point at a replica set for transactions)
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "portico")]
    pub mongodb_db: String,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Prefix for every NATS subject this replica uses
    #[arg(long, env = "SUBJECT_PREFIX", default_value = "portico")]
    pub subject_prefix: String,

    /// Secret for verifying client bearer tokens (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Seconds between pings to a connected host
    #[arg(long, env = "HOST_PING_INTERVAL_SECS", default_value = "30")]
    pub host_ping_interval_secs: u64,

    /// Seconds a host socket may stay silent before its read side gives up
    #[arg(long, env = "HOST_PONG_TIMEOUT_SECS", default_value = "7200")]
    pub host_pong_timeout_secs: u64,

    /// Seconds a host may stay unreachable before it is dropped and marked offline
    #[arg(long, env = "HOST_UNREACHABLE_GRACE_SECS", default_value = "3600")]
    pub host_unreachable_grace_secs: u64,

    /// Seconds between pings to a connected client
    #[arg(long, env = "CLIENT_PING_INTERVAL_SECS", default_value = "15")]
    pub client_ping_interval_secs: u64,

    /// Seconds a client socket may stay silent before it is dropped
    #[arg(long, env = "CLIENT_PONG_TIMEOUT_SECS", default_value = "60")]
    pub client_pong_timeout_secs: u64,

    /// Deadline for writing a single frame (including pings)
    #[arg(long, env = "WRITE_TIMEOUT_MS", default_value = "10000")]
    pub write_timeout_ms: u64,

    /// How long host selection waits for a cross-replica probe answer
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value = "2000")]
    pub probe_timeout_ms: u64,

    /// Delay before a relay loop re-subscribes after its stream ended
    #[arg(long, env = "RELAY_RESTART_DELAY_MS", default_value = "1000")]
    pub relay_restart_delay_ms: u64,

    /// Include stack traces in Exception frames for server faults
    #[arg(long, env = "EXPOSE_ERROR_STACKS", default_value = "false")]
    pub expose_error_stacks: bool,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    /// Supervisor timings derived from the CLI
    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            host_ping_interval: Duration::from_secs(self.host_ping_interval_secs),
            host_pong_timeout: Duration::from_secs(self.host_pong_timeout_secs),
            host_unreachable_grace: Duration::from_secs(self.host_unreachable_grace_secs),
            client_ping_interval: Duration::from_secs(self.client_ping_interval_secs),
            client_pong_timeout: Duration::from_secs(self.client_pong_timeout_secs),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn relay_restart_delay(&self) -> Duration {
        Duration::from_millis(self.relay_restart_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.jwt_secret.is_none() {
            return Err("JWT_SECRET is required in production mode".to_string());
        }

        if self.host_ping_interval_secs == 0 || self.client_ping_interval_secs == 0 {
            return Err("Ping intervals must be greater than zero".to_string());
        }

        if self.write_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err("WRITE_TIMEOUT_MS and PROBE_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.client_pong_timeout_secs <= self.client_ping_interval_secs {
            return Err(
                "CLIENT_PONG_TIMEOUT_SECS must be greater than CLIENT_PING_INTERVAL_SECS".to_string(),
            );
        }

        if self.host_pong_timeout_secs <= self.host_ping_interval_secs {
            return Err(
                "HOST_PONG_TIMEOUT_SECS must be greater than HOST_PING_INTERVAL_SECS".to_string(),
            );
        }

        if self.subject_prefix.is_empty() || self.subject_prefix.contains(['*', '>', ' ']) {
            return Err("SUBJECT_PREFIX must be a non-empty literal NATS token".to_string());
        }

        Ok(())
    }
}
