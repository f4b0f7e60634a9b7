//! OpenTelemetry metrics for rebound
//!
//! Metrics are pushed over OTLP/HTTP to an OpenTelemetry Collector, which can
//! expose them for Prometheus to scrape.
//!
//! ```rust,no_run
//! use rebound_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//!
//! if let Some(metrics) = rebound_metrics::metrics() {
//!     metrics.redelivery.record_scheduled("queue://Orders", 1_000);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod exporter;
mod redelivery;

pub use config::MetricsConfig;
pub use error::MetricsError;
use once_cell::sync::OnceCell;
pub use redelivery::RedeliveryMetrics;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub redelivery: RedeliveryMetrics,
}

/// Initialize the metrics system
///
/// Must be called once at startup before anything is recorded. A no-op when
/// metrics are disabled in the config.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        redelivery: RedeliveryMetrics::new()?,
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if `init_metrics` enabled it
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
