//! Persistence gateway backed by SQLite
//!
//! Tables (see `/sql/`):
//! - `devices` - provisioned credentials (read by the key cache)
//! - `raw_readings` - INSERT OR IGNORE on (device_id, sequence)
//! - `aggregate_snapshots` - UPSERT on (device_id, metric, window_start), newer version wins
//! - `dead_letters` - UPSERT on (entity_kind, entity_key)
//! - `gap_signals` - INSERT (append-only)
//!
//! rusqlite is synchronous; every call runs on the blocking pool behind a
//! single connection mutex.

use super::accumulator::Accumulator;
use super::auth::DeviceStore;
use super::error::StoreError;
use super::types::{
    AggregateSnapshot, DeadLetter, DeadLetterKind, DeviceRecord, DeviceStatus, GapSignal, Reading,
    ReadingId, WindowKey,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema files, applied in order. All statements use IF NOT EXISTS.
const MIGRATIONS: &[(&str, &str)] = &[
    ("00_devices.sql", include_str!("../../sql/00_devices.sql")),
    ("01_raw_readings.sql", include_str!("../../sql/01_raw_readings.sql")),
    (
        "02_aggregate_snapshots.sql",
        include_str!("../../sql/02_aggregate_snapshots.sql"),
    ),
    ("03_dead_letters.sql", include_str!("../../sql/03_dead_letters.sql")),
    ("04_gap_signals.sql", include_str!("../../sql/04_gap_signals.sql")),
];

/// Durable writes issued by the coordinator
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a raw reading. Returns false when the identity already existed.
    async fn write_reading(&self, reading: &Reading) -> Result<bool, StoreError>;

    /// Upsert a window snapshot. Returns false when a newer (or equally
    /// final) version is already stored.
    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<bool, StoreError>;

    async fn write_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError>;

    async fn delete_dead_letter(
        &self,
        kind: DeadLetterKind,
        entity_key: &str,
    ) -> Result<(), StoreError>;

    async fn write_gap_signal(&self, signal: &GapSignal) -> Result<(), StoreError>;
}

/// Read side used for recovery and operator queries
#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn get_aggregate(
        &self,
        device_id: &str,
        metric: &str,
        window_start: i64,
    ) -> Result<Option<AggregateSnapshot>, StoreError>;

    /// Readings with `from <= timestamp < to`, ordered by sequence
    async fn get_raw_readings(
        &self,
        device_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Reading>, StoreError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    async fn list_gap_signals(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GapSignal>, StoreError>;

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Reading>, StoreError>;

    /// Highest persisted sequence for a device
    async fn last_sequence(&self, device_id: &str) -> Result<Option<u64>, StoreError>;

    /// Snapshots for a device with `window_start >= min_window_start`
    async fn recent_snapshots(
        &self,
        device_id: &str,
        min_window_start: i64,
    ) -> Result<Vec<AggregateSnapshot>, StoreError>;
}

/// Outbox view of `raw_readings` for cloud sync
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn pending_sync(&self, limit: usize) -> Result<Vec<Reading>, StoreError>;

    async fn mark_synced(&self, ids: &[ReadingId], synced_at: i64) -> Result<usize, StoreError>;
}

/// Apply embedded schema migrations
///
/// Enables WAL mode, then executes every migration in order. Idempotent.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(500))?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    log::info!("🔧 Running schema migrations");
    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }
    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database and apply migrations
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Transient(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn)?;
        log::info!("📂 SQLite store opened at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Transient("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Transient(format!("blocking task failed: {}", e)))?
    }

    /// Register or replace a device credential
    pub async fn upsert_device(&self, record: &DeviceRecord, now: i64) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO devices (device_id, secret_hex, status, expires_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(device_id) DO UPDATE SET
                    secret_hex = excluded.secret_hex,
                    status = excluded.status,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.device_id,
                    hex::encode(&record.secret),
                    record.status.as_str(),
                    record.expires_at,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_device(
    (device_id, secret_hex, status, expires_at): (String, String, String, Option<i64>),
) -> Result<DeviceRecord, StoreError> {
    let secret = hex::decode(&secret_hex)
        .map_err(|e| StoreError::Corruption(format!("device {} secret: {}", device_id, e)))?;
    let status = DeviceStatus::from_str(&status).ok_or_else(|| {
        StoreError::Corruption(format!("device {} has unknown status '{}'", device_id, status))
    })?;
    Ok(DeviceRecord {
        device_id,
        secret,
        status,
        expires_at,
    })
}

const READING_COLUMNS: &str =
    "device_id, metric, value, timestamp, sequence, received_at, is_alert";

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        device_id: row.get(0)?,
        metric: row.get(1)?,
        value: row.get(2)?,
        timestamp: row.get(3)?,
        sequence: row.get::<_, i64>(4)? as u64,
        received_at: row.get(5)?,
        is_alert: row.get(6)?,
    })
}

const SNAPSHOT_COLUMNS: &str =
    "device_id, metric, window_start, window_size, state_json, version, last_sequence, closed, updated_at";

struct SnapshotRow {
    key: WindowKey,
    state_json: String,
    version: i64,
    last_sequence: i64,
    closed: bool,
    updated_at: i64,
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        key: WindowKey {
            device_id: row.get(0)?,
            metric: row.get(1)?,
            window_start: row.get(2)?,
            window_size: row.get(3)?,
        },
        state_json: row.get(4)?,
        version: row.get(5)?,
        last_sequence: row.get(6)?,
        closed: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn decode_snapshot(row: SnapshotRow) -> Result<AggregateSnapshot, StoreError> {
    let accumulator: Accumulator = serde_json::from_str(&row.state_json)?;
    Ok(AggregateSnapshot {
        key: row.key,
        accumulator,
        version: row.version as u64,
        last_sequence: row.last_sequence as u64,
        closed: row.closed,
        updated_at: row.updated_at,
    })
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<(String, DeadLetter)> {
    let kind: String = row.get(0)?;
    Ok((
        kind,
        DeadLetter {
            // Replaced once the kind column is decoded
            kind: DeadLetterKind::Reading,
            entity_key: row.get(1)?,
            device_id: row.get(2)?,
            reason: row.get(3)?,
            retry_count: row.get(4)?,
            payload: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        },
    ))
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn write_reading(&self, reading: &Reading) -> Result<bool, StoreError> {
        let reading = reading.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO raw_readings (
                    device_id, sequence, metric, value, timestamp, received_at, is_alert
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    reading.device_id,
                    reading.sequence as i64,
                    reading.metric,
                    reading.value,
                    reading.timestamp,
                    reading.received_at,
                    reading.is_alert,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<bool, StoreError> {
        let snapshot = snapshot.clone();
        let state_json = serde_json::to_string(&snapshot.accumulator)?;
        self.with_conn(move |conn| {
            let summary = snapshot.summary();
            let changed = conn.execute(
                r#"
                INSERT INTO aggregate_snapshots (
                    device_id, metric, window_start, window_size,
                    accumulator_kind, state_json,
                    count, sum, min, max, mean, variance,
                    version, last_sequence, closed, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(device_id, metric, window_start) DO UPDATE SET
                    window_size = excluded.window_size,
                    accumulator_kind = excluded.accumulator_kind,
                    state_json = excluded.state_json,
                    count = excluded.count,
                    sum = excluded.sum,
                    min = excluded.min,
                    max = excluded.max,
                    mean = excluded.mean,
                    variance = excluded.variance,
                    version = excluded.version,
                    last_sequence = excluded.last_sequence,
                    closed = excluded.closed,
                    updated_at = excluded.updated_at
                WHERE excluded.version > aggregate_snapshots.version
                   OR (excluded.version = aggregate_snapshots.version
                       AND excluded.closed > aggregate_snapshots.closed)
                "#,
                params![
                    snapshot.key.device_id,
                    snapshot.key.metric,
                    snapshot.key.window_start,
                    snapshot.key.window_size,
                    snapshot.accumulator.kind().as_str(),
                    state_json,
                    summary.count as i64,
                    summary.sum,
                    summary.min,
                    summary.max,
                    summary.mean,
                    summary.variance,
                    snapshot.version as i64,
                    snapshot.last_sequence as i64,
                    snapshot.closed,
                    snapshot.updated_at,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn write_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO dead_letters (
                    entity_kind, entity_key, device_id, reason, retry_count,
                    payload, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(entity_kind, entity_key) DO UPDATE SET
                    reason = excluded.reason,
                    retry_count = excluded.retry_count,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
                "#,
                params![
                    entry.kind.as_str(),
                    entry.entity_key,
                    entry.device_id,
                    entry.reason,
                    entry.retry_count,
                    entry.payload,
                    entry.created_at,
                    entry.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_dead_letter(
        &self,
        kind: DeadLetterKind,
        entity_key: &str,
    ) -> Result<(), StoreError> {
        let entity_key = entity_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM dead_letters WHERE entity_kind = ?1 AND entity_key = ?2",
                params![kind.as_str(), entity_key],
            )?;
            Ok(())
        })
        .await
    }

    async fn write_gap_signal(&self, signal: &GapSignal) -> Result<(), StoreError> {
        let signal = signal.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO gap_signals (device_id, expected, received, detected_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    signal.device_id,
                    signal.expected as i64,
                    signal.received as i64,
                    signal.detected_at,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl QueryStore for SqliteStore {
    async fn get_aggregate(
        &self,
        device_id: &str,
        metric: &str,
        window_start: i64,
    ) -> Result<Option<AggregateSnapshot>, StoreError> {
        let (device_id, metric) = (device_id.to_string(), metric.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM aggregate_snapshots \
                         WHERE device_id = ?1 AND metric = ?2 AND window_start = ?3",
                        SNAPSHOT_COLUMNS
                    ),
                    params![device_id, metric, window_start],
                    snapshot_from_row,
                )
                .optional()?;
            row.map(decode_snapshot).transpose()
        })
        .await
    }

    async fn get_raw_readings(
        &self,
        device_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Reading>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_readings \
                 WHERE device_id = ?1 AND timestamp >= ?2 AND timestamp < ?3 \
                 ORDER BY sequence ASC",
                READING_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![device_id, from, to], reading_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT entity_kind, entity_key, device_id, reason, retry_count,
                       payload, created_at, updated_at
                FROM dead_letters
                ORDER BY created_at ASC, entity_key ASC
                LIMIT ?1
                "#,
            )?;
            let rows = stmt
                .query_map(params![limit as i64], dead_letter_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(kind, mut entry)| {
                    entry.kind = DeadLetterKind::from_str(&kind).ok_or_else(|| {
                        StoreError::Corruption(format!("unknown dead letter kind '{}'", kind))
                    })?;
                    Ok(entry)
                })
                .collect()
        })
        .await
    }

    async fn list_gap_signals(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GapSignal>, StoreError> {
        let device_id = device_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT device_id, expected, received, detected_at
                FROM gap_signals
                WHERE ?1 IS NULL OR device_id = ?1
                ORDER BY id ASC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt
                .query_map(params![device_id, limit as i64], |row| {
                    Ok(GapSignal {
                        device_id: row.get(0)?,
                        expected: row.get::<_, i64>(1)? as u64,
                        received: row.get::<_, i64>(2)? as u64,
                        detected_at: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_readings WHERE is_alert = 1 \
                 ORDER BY timestamp DESC, device_id ASC LIMIT ?1",
                READING_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], reading_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn last_sequence(&self, device_id: &str) -> Result<Option<u64>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(sequence) FROM raw_readings WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )?;
            Ok(max.map(|s| s as u64))
        })
        .await
    }

    async fn recent_snapshots(
        &self,
        device_id: &str,
        min_window_start: i64,
    ) -> Result<Vec<AggregateSnapshot>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM aggregate_snapshots \
                 WHERE device_id = ?1 AND window_start >= ?2 \
                 ORDER BY metric ASC, window_start ASC",
                SNAPSHOT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![device_id, min_window_start], snapshot_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode_snapshot).collect()
        })
        .await
    }
}

#[async_trait]
impl SyncSource for SqliteStore {
    async fn pending_sync(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_readings WHERE synced = 0 \
                 ORDER BY received_at ASC, device_id ASC, sequence ASC LIMIT ?1",
                READING_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], reading_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn mark_synced(&self, ids: &[ReadingId], synced_at: i64) -> Result<usize, StoreError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE raw_readings SET synced = 1, synced_at = ?1 \
                     WHERE device_id = ?2 AND sequence = ?3",
                )?;
                for id in &ids {
                    updated += stmt.execute(params![synced_at, id.device_id, id.sequence as i64])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn lookup_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT device_id, secret_hex, status, expires_at FROM devices WHERE device_id = ?1",
                    params![device_id],
                    device_from_row,
                )
                .optional()?;
            row.map(decode_device).transpose()
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, secret_hex, status, expires_at FROM devices ORDER BY device_id",
            )?;
            let rows = stmt
                .query_map([], device_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode_device).collect()
        })
        .await
    }
}
