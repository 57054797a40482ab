//! Concord demo: several clients contend for one distributed lock on an
//! in-process store, each writing fenced values while it holds the lock.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

use concord_store::{KvStore, MemoryKvStore};

mod client;
mod config;
mod logging;
mod shutdown;

use client::ClientSettings;
use config::{Cli, DemoConfig};
use logging::LoggingConfig;

const EXPIRY_SCAN_PERIOD: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DemoConfig::load(&cli)?;
    let _logging_guard = logging::init_logging(&LoggingConfig::from_settings(&config.logging))?;

    let base_id = config
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(
        "Starting {} client(s) on lock {} (id {}, ttl {}s)",
        config.clients, config.lock_name, base_id, config.session.ttl_secs
    );

    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new().with_expiry_scan(EXPIRY_SCAN_PERIOD));
    let shutdown = shutdown::listen_for_shutdown();
    let (min_pause, max_pause) = config.pause_range();

    let mut clients = JoinSet::new();
    for n in 0..config.clients {
        let id = if config.clients == 1 {
            base_id.clone()
        } else {
            format!("{}-{}", base_id, n)
        };
        let settings = ClientSettings {
            id,
            lock_name: config.lock_name.clone(),
            key: config.key.clone(),
            iterations: config.iterations,
            min_pause,
            max_pause,
            session: config.session.clone(),
        };
        let store = store.clone();
        let shutdown = shutdown.clone();
        clients.spawn(async move { client::run(store, settings, &shutdown).await });
    }

    let mut failed = 0usize;
    while let Some(joined) = clients.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!("Client stopped with error: {:#}", e);
            }
            Err(e) => {
                failed += 1;
                error!("Client task failed: {}", e);
            }
        }
    }

    if let Some(kv) = store.get(&config.key).await? {
        info!("Final value of {}: {}", config.key, kv.value_str());
    }
    anyhow::ensure!(failed == 0, "{} client(s) failed", failed);
    Ok(())
}
