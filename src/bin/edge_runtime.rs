//! Edge Runtime
//!
//! This binary runs the telemetry pipeline on the edge node:
//! - Initializes the SQLite database (schema migrations are embedded)
//! - Loads the device key cache
//! - Creates the PipelineCoordinator
//! - Spawns background tasks (flush loop, cloud sync outbox)
//! - Feeds readings from a JSON-lines intake on stdin
//!
//! Usage:
//!   <reading source> | cargo run --release --bin edge_runtime
//!
//! Each stdin line is an `IngestRequest`; each outcome is written to stdout
//! as one JSON line `{"device_id", "sequence", "outcome"}`.
//!
//! Environment variables: see `PipelineConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wasteflow::pipeline::{
    auth::{DeviceKeyCache, DeviceStore},
    config::PipelineConfig,
    db::{PersistenceGateway, QueryStore, SqliteStore, SyncSource},
    engine::PipelineCoordinator,
    ingestion::start_pipeline_ingestion,
    sync::{CloudPublisher, JsonlOutboxPublisher, SyncWorker},
    types::{IngestOutcome, IngestRequest},
};

const INTAKE_CHANNEL_BUFFER: usize = 1024;

#[derive(Serialize)]
struct OutcomeLine<'a> {
    device_id: &'a str,
    sequence: u64,
    outcome: &'a IngestOutcome,
}

/// Write outcome lines until every sender is dropped, then hand back the sink
fn spawn_outcome_writer<W>(mut out: W, mut lines: mpsc::Receiver<String>) -> JoinHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if out.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = out.flush().await;
        }
        out
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Edge Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!(
        "   ├─ Window: {}s (grace {}s, lateness {}s)",
        config.window_size_secs, config.window_grace_secs, config.lateness_secs
    );
    info!(
        "   ├─ Buffer: {} entries (flush at {}, every {}ms)",
        config.buffer_max_entries, config.buffer_flush_threshold, config.flush_interval_ms
    );
    info!("   ├─ Max in-flight: {}", config.max_in_flight);
    info!("   └─ Sync outbox: {}", config.sync_outbox_path);

    // Initialize database
    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    info!("✅ Database initialized");

    // Device credentials; an unreadable device store is fatal at startup
    let device_store: Arc<dyn DeviceStore> = store.clone();
    let keys = Arc::new(DeviceKeyCache::new(device_store, config.stage_timeout()));
    if let Err(e) = keys.refresh_all().await {
        error!("❌ Cannot load device credentials: {}", e);
        return Err(e.into());
    }

    let gateway: Arc<dyn PersistenceGateway> = store.clone();
    let queries: Arc<dyn QueryStore> = store.clone();
    let coordinator = PipelineCoordinator::new(config.clone(), keys, gateway, queries)?;
    info!("✅ PipelineCoordinator created");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Flush / reconciliation loop
    let ingestion_handle = tokio::spawn(start_pipeline_ingestion(
        coordinator.clone(),
        shutdown_rx.clone(),
    ));

    // Cloud sync outbox
    let sync_handle = match JsonlOutboxPublisher::new(&config.sync_outbox_path) {
        Ok(publisher) => {
            let source: Arc<dyn SyncSource> = store.clone();
            let publisher: Arc<dyn CloudPublisher> = Arc::new(publisher);
            let worker = SyncWorker::new(
                source,
                publisher,
                std::time::Duration::from_millis(config.sync_interval_ms),
            );
            Some(tokio::spawn(worker.run(shutdown_rx.clone())))
        }
        Err(e) => {
            warn!("⚠️  Cloud sync disabled, outbox unavailable: {}", e);
            None
        }
    };

    // Intake: stdin JSON lines → channel → one task per reading
    let (tx, mut rx) = mpsc::channel::<IngestRequest>(INTAKE_CHANNEL_BUFFER);
    let intake_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<IngestRequest>(&line) {
                    Ok(request) => {
                        if tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("⚠️  Skipping malformed intake line: {}", e),
                },
                Ok(None) => {
                    info!("📭 Intake closed");
                    break;
                }
                Err(e) => {
                    error!("❌ Intake read failed: {}", e);
                    break;
                }
            }
        }
    });

    // Ends once every outcome sender (dispatcher and per-reading tasks) is gone
    let (out_tx, out_rx) = mpsc::channel::<String>(INTAKE_CHANNEL_BUFFER);
    let writer_handle = spawn_outcome_writer(tokio::io::stdout(), out_rx);

    let dispatcher = coordinator.clone();
    let dispatch_handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let coordinator = dispatcher.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let device_id = request.device_id.clone();
                let sequence = request.sequence;
                let outcome = coordinator.ingest(request).await;
                let line = OutcomeLine {
                    device_id: &device_id,
                    sequence,
                    outcome: &outcome,
                };
                match serde_json::to_string(&line) {
                    Ok(json) => {
                        let _ = out_tx.send(json + "\n").await;
                    }
                    Err(e) => error!("❌ Cannot encode outcome for {}/{}: {}", device_id, sequence, e),
                }
            });
        }
    });

    info!("✅ Edge runtime running");
    info!("   └─ Press Ctrl+C to stop");

    let mut exit_error: Option<String> = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutdown signal received");
        }
        message = coordinator.fatal_error() => {
            error!("💥 Stopping on fatal storage error: {}", message);
            exit_error = Some(message);
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = ingestion_handle.await {
        error!("❌ Ingestion loop panicked: {}", e);
    }
    if let Some(handle) = sync_handle {
        if let Err(e) = handle.await {
            error!("❌ Sync worker panicked: {}", e);
        }
    }

    // Close intake, then wait for every dispatched reading's outcome line
    intake_handle.abort();
    if let Err(e) = dispatch_handle.await {
        error!("❌ Intake dispatcher panicked: {}", e);
    }
    if let Err(e) = writer_handle.await {
        error!("❌ Outcome writer panicked: {}", e);
    }

    let stats = coordinator.stats();
    info!(
        "👋 Edge runtime stopped: received {} | persisted {} | rejected {} | dead-lettered {}",
        stats.received, stats.persisted, stats.rejected, stats.dead_lettered
    );

    match exit_error {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}
