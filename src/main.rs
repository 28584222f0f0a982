//! Portico - connection broker between customer hosts and browser clients

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portico::{
    config::{Args, LogFormat},
    db::MongoClient,
    pubsub::{MemoryPubSub, NatsPubSub, PubSub},
    relay::Relay,
    server,
    store::{MemoryStore, MongoStore, Store},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("portico={},info", args.log_level).into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Portico - host/client broker");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {} (prefix {})", args.nats.nats_url, args.subject_prefix);
    info!("MongoDB: {}/{}", args.mongodb_uri, args.mongodb_db);
    info!("======================================");

    // MongoDB (in-memory fallback in dev mode)
    let (store, store_backend): (Arc<dyn Store>, &'static str) =
        match connect_mongo(&args).await {
            Ok(store) => {
                info!("MongoDB connected successfully");
                (Arc::new(store), "mongodb")
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                    (Arc::new(MemoryStore::new()), "memory")
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };

    // NATS (in-memory fallback in dev mode)
    let (pubsub, bus_backend): (Arc<dyn PubSub>, &'static str) = match NatsPubSub::connect(
        &args.nats,
        &format!("portico-{}", args.node_id),
        &args.subject_prefix,
        args.probe_timeout(),
    )
    .await
    {
        Ok(bus) => {
            info!("NATS connected successfully");
            (Arc::new(bus), "nats")
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, single replica bus): {}", e);
                (Arc::new(MemoryPubSub::new(args.probe_timeout())), "memory")
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let shutdown = CancellationToken::new();
    let state = Arc::new(server::AppState::new(
        args.clone(),
        store,
        store_backend,
        Arc::clone(&pubsub),
        bus_backend,
        shutdown.clone(),
    ));

    let relay = Arc::new(Relay::new(
        Arc::clone(&pubsub),
        Arc::clone(&state.registry),
        args.relay_restart_delay(),
        args.liveness_config().write_timeout,
    ));
    let relay_tasks = relay.spawn_all(shutdown.clone());

    let server_handle = tokio::spawn(server::run(Arc::clone(&state)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown.cancel();
    let closed = state.registry.close_all();
    info!("Signalled {} registered connections", closed);

    for task in relay_tasks {
        if let Err(e) = task.await {
            warn!("Relay task ended abnormally: {}", e);
        }
    }

    if let Err(e) = pubsub.flush().await {
        warn!("Failed to flush bus: {}", e);
    }

    info!("Portico shut down");
    Ok(())
}

async fn connect_mongo(args: &Args) -> portico::Result<MongoStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoStore::new(client).await
}
