//! Pipeline runtime loop
//!
//! Drives the periodic work the coordinator does not trigger by itself:
//! - flush tick: flush every idle device (buffers, held readings, window close)
//! - replay tick: retry dead letters on a separate task, one cycle at a time
//! - stats tick: log throughput
//!
//! Runs until the shutdown channel flips to `true` or a fatal error is
//! raised, then drains the pipeline.

use super::engine::PipelineCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

const DEAD_LETTER_REPLAY_BATCH: usize = 100;
const STATS_LOG_INTERVAL_SECS: u64 = 10;

pub async fn start_pipeline_ingestion(
    coordinator: Arc<PipelineCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let flush_interval_ms = coordinator.config().flush_interval_ms;
    let replay_interval_ms = coordinator.config().dead_letter_replay_interval_ms;

    log::info!("🚀 Starting pipeline ingestion loop");
    log::info!("   ├─ Flush interval: {}ms", flush_interval_ms);
    log::info!("   └─ Dead-letter replay interval: {}ms", replay_interval_ms);

    let mut flush_timer = interval(Duration::from_millis(flush_interval_ms));
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut replay_timer = interval(Duration::from_millis(replay_interval_ms));
    replay_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_timer = interval(Duration::from_secs(STATS_LOG_INTERVAL_SECS));

    let replay_running = Arc::new(AtomicBool::new(false));
    let mut replay_task: Option<JoinHandle<()>> = None;

    let mut last_stats = coordinator.stats();
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = flush_timer.tick() => {
                let spawned = coordinator.spawn_flushes();
                log::trace!("⏱️  Flush tick: {} devices scheduled", spawned);
            }

            message = coordinator.fatal_error() => {
                log::error!("❌ Ingestion loop stopping on fatal error: {}", message);
                break;
            }

            _ = replay_timer.tick() => {
                if replay_running.swap(true, Ordering::SeqCst) {
                    log::trace!("⏱️  Dead-letter replay still running, skipping tick");
                } else {
                    replay_task = Some(spawn_replay(coordinator.clone(), replay_running.clone()));
                }
            }

            _ = stats_timer.tick() => {
                let stats = coordinator.stats();
                let elapsed = last_log_time.elapsed().as_secs_f64().max(f64::EPSILON);
                let rate = (stats.received - last_stats.received) as f64 / elapsed;
                log::info!(
                    "📊 Ingestion rate: {:.1} readings/sec | persisted {} | rejected {} | dead-lettered {} | in-flight {} | devices {}",
                    rate,
                    stats.persisted,
                    stats.rejected,
                    stats.dead_lettered,
                    stats.in_flight,
                    stats.devices
                );
                last_stats = stats;
                last_log_time = std::time::Instant::now();
            }
        }
    }

    if let Some(handle) = replay_task {
        if let Err(e) = handle.await {
            log::error!("❌ Dead-letter replay task failed: {}", e);
        }
    }

    let report = coordinator.shutdown().await;
    log::info!(
        "👋 Ingestion loop stopped ({} snapshots finalized)",
        report.snapshots_written
    );
}

/// Replay runs off the loop so slow retries never delay flush ticks
fn spawn_replay(coordinator: Arc<PipelineCoordinator>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match coordinator.replay_dead_letters(DEAD_LETTER_REPLAY_BATCH).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => log::error!("❌ Dead-letter replay hit a fatal error: {}", e),
            Err(e) => log::warn!("⚠️  Dead-letter replay failed: {}", e),
        }
        running.store(false, Ordering::SeqCst);
    })
}
