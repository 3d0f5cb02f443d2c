mod manifest;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use framequeue_core::config::{LogFormat, LoggingConfig};
use framequeue_core::{
    create_persistence_system, load_config, validate_config, JobState, Persistence,
    ProcessRenderer, RenderEngine, Renderer, SqlitePersistence,
};

use manifest::Manifest;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be installed yet if the config failed to load.
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run() -> Result<()> {
    let started = Instant::now();

    // Determine config path
    let config_path = std::env::var("FRAMEQUEUE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("framequeue.toml"));

    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    init_logging(&config.logging);
    info!(version = VERSION, "Loaded configuration from {:?}", config_path);

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        config_hash = &config_hash[..16],
        workers = config.worker.workers,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "Configuration validated"
    );

    let manifest = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .map(|path| Manifest::load(&path))
        .transpose()?;

    let renderer = Arc::new(ProcessRenderer::new(config.renderer.clone()));
    if let Err(e) = renderer.validate().await {
        warn!("Renderer is not ready, jobs will fail until it is: {}", e);
    }

    let (engine, writer_handle) = if config.persistence.enabled {
        let store: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::new(&config.persistence.path)
                .context("Failed to open persistence database")?,
        );
        info!("Persistence mirror at {:?}", config.persistence.path);
        let (handle, writer) =
            create_persistence_system(store.clone(), config.persistence.buffer_size);
        let writer_handle = tokio::spawn(writer.run());
        let engine = RenderEngine::with_persistence(config.clone(), renderer, store, handle);
        (engine, Some(writer_handle))
    } else {
        info!("Persistence disabled");
        (RenderEngine::new(config.clone(), renderer), None)
    };
    let engine = Arc::new(engine);

    let report = engine.recover().context("Failed to recover persisted state")?;
    if report.jobs > 0 {
        info!(
            jobs = report.jobs,
            batches = report.batches,
            interrupted = report.interrupted,
            failed = report.failed,
            "Resuming persisted work"
        );
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let metrics_handle = config.metrics.textfile_path.clone().map(|path| {
        info!("Writing metrics to {:?}", path);
        metrics::spawn_textfile_writer(
            Arc::clone(&engine),
            path,
            Duration::from_secs(config.metrics.interval_secs.max(1)),
            shutdown_tx.subscribe(),
        )
    });

    engine.start();

    if let Some(manifest) = manifest {
        let summary = manifest.submit(&engine);
        info!(
            jobs = summary.jobs,
            batches = summary.batches,
            rejected = summary.rejected,
            "Manifest submitted"
        );
    }

    tokio::select! {
        _ = engine.wait_idle() => info!("All work finished"),
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    engine.shutdown().await;

    let status = engine.status();
    info!(
        completed = status.jobs.get(&JobState::Completed).copied().unwrap_or(0),
        failed = status.jobs.get(&JobState::Failed).copied().unwrap_or(0),
        cancelled = status.jobs.get(&JobState::Cancelled).copied().unwrap_or(0),
        retried = status.pool.total_retried,
        "Render engine summary"
    );

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
        if let Some(ref path) = config.metrics.textfile_path {
            metrics::collect_dynamic_metrics(&engine, started.elapsed());
            if let Err(e) = metrics::write_textfile(path).await {
                warn!("Failed to write final metrics: {}", e);
            }
        }
    }

    // Drop every holder of the persistence handle so the writer's channel closes.
    drop(engine);
    if let Some(handle) = writer_handle {
        let _ = handle.await;
        info!("Persistence writer stopped");
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
