//! Cloud sync outbox
//!
//! Raw readings are stored with `synced = 0`. Every cycle the worker takes
//! up to `SYNC_BATCH_LIMIT` unsynced readings, publishes alerts one at a time
//! (highest priority), then the rest as a single batch, and marks whatever
//! was published as synced. A disconnected publisher skips the cycle; the
//! readings stay in the outbox for the next one.

use super::db::SyncSource;
use super::error::StoreError;
use super::types::Reading;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub const SYNC_BATCH_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher not connected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Upstream link for synced readings
#[async_trait]
pub trait CloudPublisher: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish_alert(&self, reading: &Reading) -> Result<(), PublishError>;

    async fn publish_batch(&self, readings: &[Reading]) -> Result<(), PublishError>;
}

/// Wire shape sent upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPayload {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub sequence: u64,
    pub recorded_at: String,
    pub received_at: String,
    pub is_alert: bool,
}

fn rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

impl From<&Reading> for ReadingPayload {
    fn from(reading: &Reading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            metric: reading.metric.clone(),
            value: reading.value,
            sequence: reading.sequence,
            recorded_at: rfc3339(reading.timestamp),
            received_at: rfc3339(reading.received_at),
            is_alert: reading.is_alert,
        }
    }
}

/// Appends JSON lines under an outbox directory for an external forwarder
pub struct JsonlOutboxPublisher {
    dir: PathBuf,
}

impl JsonlOutboxPublisher {
    pub const ALERTS_FILE: &'static str = "alerts.jsonl";
    pub const READINGS_FILE: &'static str = "readings.jsonl";

    pub fn new(dir: impl AsRef<Path>) -> Result<Self, PublishError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    async fn append(&self, file: &str, lines: &[String]) -> Result<(), PublishError> {
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        out.write_all(buf.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CloudPublisher for JsonlOutboxPublisher {
    fn is_connected(&self) -> bool {
        self.dir.is_dir()
    }

    async fn publish_alert(&self, reading: &Reading) -> Result<(), PublishError> {
        let line = serde_json::to_string(&ReadingPayload::from(reading))?;
        self.append(Self::ALERTS_FILE, &[line]).await
    }

    async fn publish_batch(&self, readings: &[Reading]) -> Result<(), PublishError> {
        let lines = readings
            .iter()
            .map(|r| serde_json::to_string(&ReadingPayload::from(r)))
            .collect::<Result<Vec<_>, _>>()?;
        self.append(Self::READINGS_FILE, &lines).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pending: usize,
    pub alerts_published: usize,
    pub alerts_failed: usize,
    pub batch_published: usize,
    pub marked: usize,
    /// Publisher was disconnected, nothing attempted
    pub skipped: bool,
}

pub struct SyncWorker {
    source: Arc<dyn SyncSource>,
    publisher: Arc<dyn CloudPublisher>,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(
        source: Arc<dyn SyncSource>,
        publisher: Arc<dyn CloudPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            publisher,
            interval,
        }
    }

    pub async fn run_cycle(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();

        if !self.publisher.is_connected() {
            log::warn!("📡 Publisher not connected, skipping sync (retry next interval)");
            report.skipped = true;
            return Ok(report);
        }

        let pending = self.source.pending_sync(SYNC_BATCH_LIMIT).await?;
        report.pending = pending.len();
        if pending.is_empty() {
            log::debug!("📡 No pending readings to sync");
            return Ok(report);
        }

        let (alerts, normal): (Vec<Reading>, Vec<Reading>) =
            pending.into_iter().partition(|r| r.is_alert);
        log::info!(
            "📡 Syncing {} readings ({} alerts, {} normal)",
            report.pending,
            alerts.len(),
            normal.len()
        );

        let mut synced = Vec::with_capacity(report.pending);

        for alert in &alerts {
            match self.publisher.publish_alert(alert).await {
                Ok(()) => {
                    synced.push(alert.identity());
                    report.alerts_published += 1;
                }
                Err(e) => {
                    log::warn!("   ❌ Alert {} failed to publish: {}", alert.identity(), e);
                    report.alerts_failed += 1;
                }
            }
        }

        if !normal.is_empty() {
            match self.publisher.publish_batch(&normal).await {
                Ok(()) => {
                    synced.extend(normal.iter().map(Reading::identity));
                    report.batch_published = normal.len();
                }
                Err(e) => log::warn!("   ❌ Batch of {} failed to publish: {}", normal.len(), e),
            }
        }

        if !synced.is_empty() {
            report.marked = self
                .source
                .mark_synced(&synced, Utc::now().timestamp())
                .await?;
        }

        log::info!(
            "📡 Sync complete: {}/{} readings synced",
            report.marked,
            report.pending
        );
        Ok(report)
    }

    /// Run cycles on the configured interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("📡 Sync worker started (interval {}ms)", self.interval.as_millis());
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        log::error!("❌ Sync cycle failed: {}", e);
                    }
                }
            }
        }
        log::info!("📡 Sync worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{PersistenceGateway, SqliteStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPublisher {
        offline: AtomicBool,
        fail_batches: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudPublisher for RecordingPublisher {
        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }

        async fn publish_alert(&self, reading: &Reading) -> Result<(), PublishError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("alert {}", reading.identity()));
            Ok(())
        }

        async fn publish_batch(&self, readings: &[Reading]) -> Result<(), PublishError> {
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(PublishError::Disconnected);
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("batch {}", readings.len()));
            Ok(())
        }
    }

    async fn seeded_store() -> (TempDir, Arc<SqliteStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("sync.db").to_str().unwrap()).unwrap());
        for seq in 1..=4u64 {
            store
                .write_reading(&Reading {
                    device_id: "D1".to_string(),
                    metric: "fill_level".to_string(),
                    value: 20.0 * seq as f64,
                    timestamp: 1_700_000_000 + seq as i64,
                    sequence: seq,
                    received_at: 1_700_000_010 + seq as i64,
                    is_alert: seq == 4,
                })
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn test_alerts_first_then_batch() {
        let (_dir, store) = seeded_store().await;
        let publisher = Arc::new(RecordingPublisher::default());
        let worker = SyncWorker::new(store.clone(), publisher.clone(), Duration::from_secs(60));

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.pending, 4);
        assert_eq!(report.alerts_published, 1);
        assert_eq!(report.batch_published, 3);
        assert_eq!(report.marked, 4);
        assert_eq!(
            *publisher.calls.lock().unwrap(),
            vec!["alert D1/4".to_string(), "batch 3".to_string()]
        );

        // Nothing left on the next cycle
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.pending, 0);
    }

    #[tokio::test]
    async fn test_disconnected_publisher_skips_cycle() {
        let (_dir, store) = seeded_store().await;
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.offline.store(true, Ordering::SeqCst);
        let worker = SyncWorker::new(store.clone(), publisher.clone(), Duration::from_secs(60));

        let report = worker.run_cycle().await.unwrap();
        assert!(report.skipped);
        assert_eq!(store.pending_sync(10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_batch_stays_pending() {
        let (_dir, store) = seeded_store().await;
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.fail_batches.store(true, Ordering::SeqCst);
        let worker = SyncWorker::new(store.clone(), publisher.clone(), Duration::from_secs(60));

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.marked, 1);

        let pending = store.pending_sync(10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| !r.is_alert));
    }

    #[tokio::test]
    async fn test_jsonl_outbox_writes_camel_case_lines() {
        let (_dir, store) = seeded_store().await;
        let outbox = TempDir::new().unwrap();
        let publisher = Arc::new(JsonlOutboxPublisher::new(outbox.path().join("out")).unwrap());
        let worker = SyncWorker::new(store, publisher, Duration::from_secs(60));

        worker.run_cycle().await.unwrap();

        let alerts = std::fs::read_to_string(
            outbox.path().join("out").join(JsonlOutboxPublisher::ALERTS_FILE),
        )
        .unwrap();
        let readings = std::fs::read_to_string(
            outbox.path().join("out").join(JsonlOutboxPublisher::READINGS_FILE),
        )
        .unwrap();

        assert_eq!(alerts.lines().count(), 1);
        assert_eq!(readings.lines().count(), 3);

        let line: serde_json::Value = serde_json::from_str(alerts.lines().next().unwrap()).unwrap();
        assert_eq!(line["deviceId"], "D1");
        assert_eq!(line["isAlert"], true);
        assert_eq!(line["sequence"], 4);
        assert!(line["recordedAt"].as_str().unwrap().starts_with("2023-11-14T"));
    }
}
