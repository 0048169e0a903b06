//! Grendel broker daemon.
//!
//! Hosts the broker core: stores, ACL cache, router, session manager, and
//! the periodic maintenance tasks. Protocol front-ends (MQTT listeners,
//! admin APIs) link against `grendel-broker` and drive the session
//! manager and router; this binary owns their shared state and lifecycle.

mod config;
mod stores;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grendel_broker::acl::AclCache;
use grendel_broker::archive::ArchiveRegistry;
use grendel_broker::broadcast::{Broadcast, BrokerEvent};
use grendel_broker::metrics::MetricsCollector;
use grendel_broker::router::Router;
use grendel_broker::session::{bootstrap_users, SessionManager};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "grendeld", about = "Grendel MQTT broker daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "grendeld.toml")]
    config: PathBuf,

    /// Override the node id from the configuration
    #[arg(long)]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        match Config::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", args.config.display());
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };
    if let Some(node_id) = args.node_id {
        config.broker.node_id = node_id;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let broker_config = Arc::new(config.broker.clone());
    info!(node_id = %broker_config.node_id, backend = %config.storage.backend, "starting");

    let stores = stores::build(&config.storage)?;
    let bus = Broadcast::default();

    bootstrap_users(
        stores.users.as_ref(),
        config.auth.admin_password.as_deref(),
        broker_config.allow_anonymous,
    )
    .await?;

    let acl = Arc::new(AclCache::new(broker_config.acl_cache_size));
    acl.refresh(stores.users.as_ref()).await?;

    let archives = Arc::new(ArchiveRegistry::new());
    archives
        .load(stores.groups.as_ref(), stores.factory.as_ref())
        .await?;

    let metrics = Arc::new(MetricsCollector::new(
        broker_config.node_id.clone(),
        Arc::clone(&stores.metrics),
    ));

    let router = Arc::new(Router::new(
        Arc::clone(&broker_config),
        Arc::clone(&stores.retained),
        Arc::clone(&stores.sessions),
        Arc::clone(&acl),
        Arc::clone(&archives),
        Arc::clone(&metrics),
    ));

    let session_manager = Arc::new(SessionManager::new(
        Arc::clone(&broker_config),
        Arc::clone(&router),
        Arc::clone(&stores.sessions),
        Arc::clone(&stores.users),
        Arc::clone(&acl),
        bus.clone(),
    ));

    session_manager.cold_start().await?;
    session_manager.spawn_acl_refresh_task();
    Arc::clone(&metrics).spawn_flush_task(broker_config.metrics_interval, bus.clone());
    Arc::clone(&archives).spawn_purge_task(bus.clone());

    if let Some(sqlite) = stores.sqlite.clone() {
        spawn_health_check(sqlite, bus.clone());
    }

    info!("broker core running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    bus.send(BrokerEvent::Shutdown);

    // Give the flush tasks a moment to finish their final writes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Probe the store connection on a fixed cadence; the store reopens
/// itself on failure.
fn spawn_health_check(store: grendel_storage::sqlite::SqliteStore, bus: Broadcast) {
    tokio::spawn(async move {
        let mut events = bus.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.health_check().await {
                        warn!(error = %e, "store health check failed");
                    }
                }
                event = events.recv() => {
                    if matches!(event, Ok(BrokerEvent::Shutdown) | Err(_)) {
                        return;
                    }
                }
            }
        }
    });
}
