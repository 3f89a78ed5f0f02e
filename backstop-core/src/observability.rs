/*!
Observability setup for backstop.

- Structured logging through `tracing-subscriber` (JSON or human readable)
- Prometheus counters for backup, restore and offsite activity, behind the
  `metrics` feature

The `record_*` helpers are always available and compile to no-ops when the
feature is off, so call sites never need their own `cfg`.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::metadata::BackupType;
use crate::{BackstopError, Result};

/// Default filter directive when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "backstop=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackstopMetrics>> = OnceLock::new();

/// Counters for backstop operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackstopMetrics {
    pub backups_started_total: Counter,
    pub backups_completed_total: Counter,
    pub backups_failed_total: Counter,
    pub restores_total: Counter,
    pub restores_failed_total: Counter,
    pub offsite_transfers_total: Counter,
    pub offsite_failures_total: Counter,
    pub artifact_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackstopError {
    BackstopError::configuration(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl BackstopMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };

        let backups_started_total =
            counter("backstop_backups_started_total", "Backups started")?;
        let backups_completed_total =
            counter("backstop_backups_completed_total", "Backups completed")?;
        let backups_failed_total = counter("backstop_backups_failed_total", "Backups failed")?;
        let restores_total = counter("backstop_restores_total", "Restores attempted")?;
        let restores_failed_total = counter("backstop_restores_failed_total", "Restores failed")?;
        let offsite_transfers_total = counter(
            "backstop_offsite_transfers_total",
            "Artifacts replicated offsite",
        )?;
        let offsite_failures_total = counter(
            "backstop_offsite_failures_total",
            "Offsite transfers that failed",
        )?;

        let artifact_size_bytes = Histogram::with_opts(
            HistogramOpts::new("backstop_artifact_size_bytes", "Size of finished artifacts")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| {
                    metric_error("backstop_artifact_size_bytes", e)
                })?),
        )
        .map_err(|e| metric_error("backstop_artifact_size_bytes", e))?;
        registry
            .register(Box::new(artifact_size_bytes.clone()))
            .map_err(|e| metric_error("backstop_artifact_size_bytes", e))?;

        Ok(Self {
            backups_started_total,
            backups_completed_total,
            backups_failed_total,
            restores_total,
            restores_failed_total,
            offsite_transfers_total,
            offsite_failures_total,
            artifact_size_bytes,
            registry,
        })
    }

    /// Global instance, or `None` if registration failed
    pub fn global() -> Option<&'static BackstopMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Render every metric in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| BackstopError::configuration(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| {
            BackstopError::configuration(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Metrics in the Prometheus text format; empty without the `metrics` feature
pub fn gather_metrics() -> Result<String> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = BackstopMetrics::global() {
        return metrics.gather_metrics();
    }
    Ok(String::new())
}

pub(crate) fn record_backup_started(backup_type: BackupType) {
    tracing::trace!(backup_type = %backup_type, "metric: backup started");
    #[cfg(feature = "metrics")]
    if let Some(m) = BackstopMetrics::global() {
        m.backups_started_total.inc();
    }
}

pub(crate) fn record_backup_finished(success: bool, size: u64) {
    #[cfg(feature = "metrics")]
    if let Some(m) = BackstopMetrics::global() {
        if success {
            m.backups_completed_total.inc();
            m.artifact_size_bytes.observe(size as f64);
        } else {
            m.backups_failed_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (success, size);
}

pub(crate) fn record_restore(success: bool) {
    #[cfg(feature = "metrics")]
    if let Some(m) = BackstopMetrics::global() {
        m.restores_total.inc();
        if !success {
            m.restores_failed_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = success;
}

pub(crate) fn record_offsite(success: bool) {
    #[cfg(feature = "metrics")]
    if let Some(m) = BackstopMetrics::global() {
        if success {
            m.offsite_transfers_total.inc();
        } else {
            m.offsite_failures_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = success;
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default `backstop=info` filter. With `json` set
/// every event is one JSON object per line; otherwise output is the compact
/// human-readable format.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackstopMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_DIRECTIVE))
        .map_err(|e| BackstopError::configuration(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false));
        set_global_default(subscriber)
    };
    result.map_err(|e| {
        BackstopError::configuration(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_panicking() {
        record_backup_started(BackupType::Database);
        record_backup_finished(true, 1200);
        record_backup_finished(false, 0);
        record_restore(true);
        record_offsite(false);
        assert!(gather_metrics().is_ok());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_backup_started(BackupType::Files);
        let text = gather_metrics().unwrap();
        assert!(text.contains("backstop_backups_started_total"));
    }
}
