use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use rebound_common::{Clock, Signal, SystemClock, internal, logging, tracing};
use rebound_metrics::MetricsConfig;
use rebound_redelivery::{
    DeadLetterRouter, JobHandler, PluginChain, RedeliveryConfig, RedeliveryError,
    RedeliveryPlugin, RedeliveryScheduler,
};
use rebound_store::{JobStore, StoreConfig};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broker::Broker;

/// Configuration file lookup order after an explicit path
pub const DEFAULT_CONFIG_PATHS: [&str; 2] =
    ["./rebound.config.ron", "/etc/rebound/rebound.config.ron"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found. Tried:\n{tried}")]
    NotFound { tried: String },

    #[error("Configuration file {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("Failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Top-level configuration
///
/// ```ron
/// (
///     redelivery: (
///         queue_policies: (default_entry: Some((maximum_redeliveries: 2))),
///         dead_letter: Shared(queue_name: "DLQ"),
///     ),
///     store: File((path: "/var/lib/rebound/jobs")),
///     metrics: (enabled: false),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Rebound {
    #[serde(default)]
    pub redelivery: RedeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Find the configuration file using the following precedence:
/// 1. An explicit path (`--config` or `REBOUND_CONFIG`)
/// 2. ./rebound.config.ron (current working directory)
/// 3. /etc/rebound/rebound.config.ron (system-wide config)
///
/// # Errors
/// If an explicit path does not exist, or none of the defaults do
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::Missing(path.to_path_buf()));
    }

    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| ConfigError::NotFound {
            tried: DEFAULT_CONFIG_PATHS
                .iter()
                .map(|path| format!("  - {path}"))
                .collect::<Vec<_>>()
                .join("\n"),
        })
}

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// A running broker with redelivery installed
#[derive(Debug)]
pub struct Service {
    broker: Arc<Broker>,
    scheduler: Arc<RedeliveryScheduler>,
    plugin: Arc<RedeliveryPlugin>,
}

impl Service {
    #[must_use]
    pub const fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<RedeliveryScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn plugin(&self) -> &Arc<RedeliveryPlugin> {
        &self.plugin
    }

    /// Drive the scheduler until shutdown is signalled
    ///
    /// # Errors
    /// If pending jobs could not be flushed on shutdown
    pub async fn serve(
        &self,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), RedeliveryError> {
        let handler: Arc<dyn JobHandler> = self.plugin.clone();
        self.scheduler.serve(handler, shutdown).await
    }
}

impl Rebound {
    /// Parse a configuration file
    ///
    /// # Errors
    /// If the file cannot be read or is not valid configuration
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ron::from_str(&content)?)
    }

    /// Open the configured store and build the service on the wall clock
    ///
    /// # Errors
    /// If the store cannot be opened or its jobs cannot be recovered
    pub async fn build(self) -> anyhow::Result<Service> {
        let store = self.store.clone().open()?;
        self.build_with(store, Arc::new(SystemClock)).await
    }

    /// Build the service over an explicit store and clock
    ///
    /// Recovery of persisted jobs completes before the plugin is installed,
    /// so no new job can be scheduled ahead of a recovered one.
    ///
    /// # Errors
    /// If persisted jobs cannot be recovered
    pub async fn build_with(
        self,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Service> {
        let broker = Broker::new();

        let scheduler = Arc::new(RedeliveryScheduler::new(
            store,
            clock,
            self.redelivery.scheduler.clone(),
        ));
        let recovered = scheduler.init().await?;

        let plugin = Arc::new(RedeliveryPlugin::new(
            self.redelivery.resolver(),
            DeadLetterRouter::new(self.redelivery.dead_letter.clone(), broker.clone()),
            scheduler.clone(),
            broker.clone(),
        ));

        broker.install_plugins(PluginChain::new().with(plugin.clone()));

        internal!(
            level = INFO,
            "Broker ready: {recovered} recovered jobs, dead-letter strategy {:?}",
            self.redelivery.dead_letter
        );

        Ok(Service {
            broker,
            scheduler,
            plugin,
        })
    }

    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if metrics, the store or the
    /// scheduler fail to initialise, or if pending jobs cannot be flushed on
    /// shutdown.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        rebound_metrics::init_metrics(&self.metrics)?;

        internal!("Controller running");

        let service = self.build().await?;

        let ret = tokio::select! {
            r = service.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
