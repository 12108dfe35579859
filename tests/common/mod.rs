//! Shared fixtures for the integration tests
//!
//! - `FlakyGateway` wraps the SQLite store and injects failures per operation
//! - `TestClock` is a settable unix-seconds clock handed to the coordinator
//! - `Harness` provisions devices, builds a coordinator and signs readings

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wasteflow::pipeline::{
    auth::{sign_reading, DeviceKeyCache, DeviceStore},
    config::PipelineConfig,
    db::{PersistenceGateway, QueryStore, SqliteStore},
    engine::PipelineCoordinator,
    error::StoreError,
    types::{AggregateSnapshot, DeadLetter, DeadLetterKind, DeviceRecord, GapSignal, IngestRequest, Reading},
};

/// Aligned to a 60s window boundary
pub const START: i64 = 12_000;

#[derive(Clone)]
pub struct TestClock(Arc<AtomicI64>);

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn boxed(&self) -> Box<dyn Fn() -> i64 + Send + Sync> {
        let inner = self.0.clone();
        Box::new(move || inner.load(Ordering::SeqCst))
    }
}

/// Gateway that fails on demand before delegating to SQLite
pub struct FlakyGateway {
    inner: Arc<SqliteStore>,
    reading_failures: AtomicU32,
    snapshot_failures: AtomicU32,
    failing_devices: Mutex<HashSet<String>>,
    corrupt: AtomicBool,
    pub reading_attempts: AtomicU32,
}

impl FlakyGateway {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            reading_failures: AtomicU32::new(0),
            snapshot_failures: AtomicU32::new(0),
            failing_devices: Mutex::new(HashSet::new()),
            corrupt: AtomicBool::new(false),
            reading_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` raw reading writes with a transient error
    pub fn fail_readings(&self, n: u32) {
        self.reading_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_snapshots(&self, n: u32) {
        self.snapshot_failures.store(n, Ordering::SeqCst);
    }

    /// Every raw reading write for `device_id` fails until healed
    pub fn fail_device(&self, device_id: &str) {
        self.failing_devices
            .lock()
            .unwrap()
            .insert(device_id.to_string());
    }

    pub fn heal(&self) {
        self.reading_failures.store(0, Ordering::SeqCst);
        self.snapshot_failures.store(0, Ordering::SeqCst);
        self.failing_devices.lock().unwrap().clear();
        self.corrupt.store(false, Ordering::SeqCst);
    }

    pub fn corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn write_reading(&self, reading: &Reading) -> Result<bool, StoreError> {
        self.reading_attempts.fetch_add(1, Ordering::SeqCst);
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(StoreError::Corruption("database disk image is malformed".to_string()));
        }
        if self.failing_devices.lock().unwrap().contains(&reading.device_id) {
            return Err(StoreError::Transient("database is locked".to_string()));
        }
        if Self::take_failure(&self.reading_failures) {
            return Err(StoreError::Transient("database is busy".to_string()));
        }
        self.inner.write_reading(reading).await
    }

    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<bool, StoreError> {
        if Self::take_failure(&self.snapshot_failures) {
            return Err(StoreError::Transient("database is busy".to_string()));
        }
        self.inner.write_snapshot(snapshot).await
    }

    async fn write_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError> {
        self.inner.write_dead_letter(entry).await
    }

    async fn delete_dead_letter(
        &self,
        kind: DeadLetterKind,
        entity_key: &str,
    ) -> Result<(), StoreError> {
        self.inner.delete_dead_letter(kind, entity_key).await
    }

    async fn write_gap_signal(&self, signal: &GapSignal) -> Result<(), StoreError> {
        self.inner.write_gap_signal(signal).await
    }
}

pub fn secret_for(device_id: &str) -> Vec<u8> {
    format!("secret-{}", device_id).into_bytes()
}

/// Small windows, immediate flushes and millisecond backoff
pub fn test_config(db_path: &str) -> PipelineConfig {
    PipelineConfig {
        db_path: db_path.to_string(),
        window_size_secs: 60,
        window_grace_secs: 10,
        lateness_secs: 30,
        buffer_max_entries: 16,
        buffer_flush_threshold: 1,
        flush_interval_ms: 20,
        max_sequence_gap: 100,
        retry_max_attempts: 3,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        stage_timeout_ms: 1_000,
        ingest_timeout_ms: 5_000,
        backpressure_failure_threshold: 2,
        backpressure_cooldown_ms: 60_000,
        max_in_flight: 1_000,
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<FlakyGateway>,
    pub keys: Arc<DeviceKeyCache>,
    pub clock: TestClock,
    pub config: PipelineConfig,
    pub coordinator: Arc<PipelineCoordinator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Provision D1 and D2, then build a coordinator over a fresh database
    pub async fn with_config(tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("wasteflow.db");
        let mut config = test_config(db_path.to_str().unwrap());
        tweak(&mut config);

        let store = Arc::new(SqliteStore::open(&config.db_path).unwrap());
        for device in ["D1", "D2"] {
            store
                .upsert_device(&DeviceRecord::active(device, secret_for(device)), START)
                .await
                .unwrap();
        }

        let clock = TestClock::new(START);
        let device_store: Arc<dyn DeviceStore> = store.clone();
        let keys = Arc::new(DeviceKeyCache::new(device_store, Duration::from_secs(1)));
        keys.refresh_all().await.unwrap();

        let gateway = Arc::new(FlakyGateway::new(store.clone()));
        let coordinator = build_coordinator(&config, &keys, &gateway, &store, &clock);

        Self {
            dir,
            store,
            gateway,
            keys,
            clock,
            config,
            coordinator,
        }
    }

    /// A second coordinator over the same database (process restart)
    pub fn restart(&self) -> Arc<PipelineCoordinator> {
        build_coordinator(&self.config, &self.keys, &self.gateway, &self.store, &self.clock)
    }

    pub fn request(&self, device_id: &str, sequence: u64, value: f64, timestamp: i64) -> IngestRequest {
        signed(device_id, "fill_level", sequence, value, timestamp)
    }

    /// Wait until `n` readings sit in device buffers
    pub async fn wait_buffered(&self, n: usize) {
        wait_until(|| self.coordinator.buffered_len() >= n).await;
    }
}

fn build_coordinator(
    config: &PipelineConfig,
    keys: &Arc<DeviceKeyCache>,
    gateway: &Arc<FlakyGateway>,
    store: &Arc<SqliteStore>,
    clock: &TestClock,
) -> Arc<PipelineCoordinator> {
    let gateway: Arc<dyn PersistenceGateway> = gateway.clone();
    let queries: Arc<dyn QueryStore> = store.clone();
    PipelineCoordinator::new_with_timestamp_fn(
        config.clone(),
        keys.clone(),
        gateway,
        queries,
        clock.boxed(),
    )
    .unwrap()
}

pub fn signed(device_id: &str, metric: &str, sequence: u64, value: f64, timestamp: i64) -> IngestRequest {
    IngestRequest {
        device_id: device_id.to_string(),
        metric: metric.to_string(),
        value,
        timestamp,
        sequence,
        auth_tag: sign_reading(&secret_for(device_id), device_id, metric, value, timestamp, sequence),
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
