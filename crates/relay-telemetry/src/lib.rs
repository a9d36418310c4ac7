//! Telemetry: tracing initialization, a SQLite sink for warn+ logs, and an
//! in-memory metrics recorder whose snapshots are handed to an external
//! exporter.

mod logging;
mod metrics;

pub use logging::{LogFilter, LogStoreError, RunLogLayer, RunLogStore, StoredLog};
pub use metrics::{HistogramSummary, MetricPoint, MetricValue, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            log_to_sqlite: true,
            log_db_path: home_fallback().join(".relay/logs.db"),
        }
    }
}

/// Holds the log store and metrics recorder for the process lifetime.
pub struct TelemetryGuard {
    log_store: Option<Arc<RunLogStore>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    pub fn logs(&self) -> Option<Arc<RunLogStore>> {
        self.log_store.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_filter(env_filter);

    let (log_layer, log_store) = if config.log_to_sqlite {
        match RunLogStore::open(&config.log_db_path) {
            Ok(store) => {
                let store = Arc::new(store);
                (Some(RunLogLayer::new(store.clone())), Some(store))
            }
            Err(e) => {
                eprintln!("relay-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(log_layer)
        .init();

    TelemetryGuard {
        log_store,
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

fn home_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
