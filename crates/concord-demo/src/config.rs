//! Configuration for the demo client
//!
//! Sources, lowest precedence first: `conf/application.yml`, `CONCORD_`
//! environment variables (`__` separates nested keys, e.g.
//! `CONCORD_SESSION__TTL_SECS`), then command line flags.

use std::time::Duration;

use clap::Parser;
use config::{Config, Environment};
use serde::Deserialize;

use concord_concurrency::SessionConfig;

/// Command line arguments for the demo
#[derive(Debug, Default, Parser)]
#[command(name = "concord", about = "Contend for a distributed lock and write fenced values")]
pub struct Cli {
    /// Lock name; lock keys live under `<name>/`
    #[arg(long = "lock-name")]
    pub lock_name: Option<String>,
    /// Holder id written into the lock key (default: random UUID)
    #[arg(long = "id", env = "CONCORD_ID")]
    pub id: Option<String>,
    /// Key written under the lock
    #[arg(long = "key")]
    pub key: Option<String>,
    /// Number of in-process clients contending for the lock
    #[arg(short = 'c', long = "clients")]
    pub clients: Option<u32>,
    /// Session lease ttl in seconds
    #[arg(long = "ttl-secs")]
    pub ttl_secs: Option<u64>,
    /// Lock cycles per client; 0 runs until shutdown
    #[arg(short = 'n', long = "iterations")]
    pub iterations: Option<u64>,
    #[arg(long = "config", default_value = "conf/application.yml")]
    pub config: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub console: bool,
    pub file: bool,
    /// Directory for the rolling log file (default: `logs`)
    pub dir: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: false,
            dir: None,
        }
    }
}

/// Demo settings after all sources are merged
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub lock_name: String,
    pub id: Option<String>,
    pub key: String,
    pub clients: u32,
    pub iterations: u64,
    /// Bounds of the random pause before each lock and while holding it
    pub min_pause_ms: u64,
    pub max_pause_ms: u64,
    pub session: SessionConfig,
    pub logging: LogSettings,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            lock_name: "/my-lock".to_string(),
            id: None,
            key: "/my-key".to_string(),
            clients: 3,
            iterations: 0,
            min_pause_ms: 1000,
            max_pause_ms: 4000,
            session: SessionConfig::default(),
            logging: LogSettings::default(),
        }
    }
}

impl DemoConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(config::File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix("concord")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = &cli.lock_name {
            builder = builder.set_override("lock_name", v.as_str())?;
        }
        if let Some(v) = &cli.id {
            builder = builder.set_override("id", v.as_str())?;
        }
        if let Some(v) = &cli.key {
            builder = builder.set_override("key", v.as_str())?;
        }
        if let Some(v) = cli.clients {
            builder = builder.set_override("clients", i64::from(v))?;
        }
        if let Some(v) = cli.ttl_secs {
            builder = builder.set_override("session.ttl_secs", v)?;
        }
        if let Some(v) = cli.iterations {
            builder = builder.set_override("iterations", v)?;
        }

        let config: DemoConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.lock_name.is_empty(), "lock_name must not be empty");
        anyhow::ensure!(self.clients > 0, "clients must be at least 1");
        anyhow::ensure!(self.session.ttl_secs > 0, "session.ttl_secs must be positive");
        anyhow::ensure!(
            self.min_pause_ms <= self.max_pause_ms,
            "min_pause_ms must not exceed max_pause_ms"
        );
        Ok(())
    }

    pub fn pause_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_pause_ms),
            Duration::from_millis(self.max_pause_ms),
        )
    }
}
