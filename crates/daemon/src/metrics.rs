//! Prometheus metrics for observability.
//!
//! The daemon has no listener of its own; when `metrics.textfile_path` is
//! set it periodically writes the text exposition there for a node
//! exporter's textfile collector.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use framequeue_core::RenderEngine;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Batches currently known to the engine.
pub static BATCHES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("framequeue_batches", "Number of batches held by the engine").unwrap()
});

/// Seconds since the daemon started.
pub static UPTIME_SECONDS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("framequeue_uptime_seconds", "Seconds since the daemon started").unwrap()
});

fn register_metrics(registry: &Registry) {
    registry.register(Box::new(BATCHES.clone())).unwrap();
    registry.register(Box::new(UPTIME_SECONDS.clone())).unwrap();

    for metric in framequeue_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Update gauges that are read from the engine rather than counted.
pub fn collect_dynamic_metrics(engine: &RenderEngine, uptime: Duration) {
    BATCHES.set(engine.status().batches as i64);
    UPTIME_SECONDS.set(uptime.as_secs() as i64);
}

/// Write the exposition next to `path` and rename it into place so readers
/// never see a partial file.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, encode_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Periodically refresh and write the textfile until `shutdown` fires.
pub fn spawn_textfile_writer(
    engine: std::sync::Arc<RenderEngine>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let started = std::time::Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    collect_dynamic_metrics(&engine, started.elapsed());
                    match write_textfile(&path).await {
                        Ok(()) => debug!(path = %path.display(), "Wrote metrics textfile"),
                        Err(e) => warn!(path = %path.display(), "Failed to write metrics textfile: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use framequeue_core::metrics::QUEUE_DEPTH;
    use tempfile::TempDir;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        QUEUE_DEPTH.set(0);
        BATCHES.set(0);

        let output = encode_metrics();
        assert!(output.contains("framequeue_queue_depth"));
        assert!(output.contains("framequeue_batches"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[tokio::test]
    async fn test_write_textfile_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("framequeue.prom");
        std::fs::write(&path, "stale").unwrap();

        write_textfile(&path).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("framequeue_"));
        assert!(!dir.path().join("framequeue.prom.tmp").exists());
    }
}
