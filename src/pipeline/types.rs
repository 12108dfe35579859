//! Core data structures for the ingestion pipeline
//!
//! Persisted layout (see `db.rs`):
//! - `raw_readings` keyed by (device_id, sequence) → `Reading`
//! - `aggregate_snapshots` keyed by (device_id, metric, window_start) → `AggregateSnapshot`
//! - `dead_letters` keyed by (entity_kind, entity_key) → `DeadLetter`
//! - `gap_signals` → `GapSignal`

use super::accumulator::{Accumulator, AggregateSummary};
use super::error::{AuthError, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provisioning status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Revoked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DeviceStatus::Active),
            "revoked" => Some(DeviceStatus::Revoked),
            _ => None,
        }
    }
}

/// Device credential record as provisioned externally
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Shared secret used to key the reading tag
    pub secret: Vec<u8>,
    pub status: DeviceStatus,
    /// Credential expiry (unix seconds), `None` = never expires
    pub expires_at: Option<i64>,
}

impl DeviceRecord {
    pub fn active(device_id: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            device_id: device_id.into(),
            secret: secret.as_ref().to_vec(),
            status: DeviceStatus::Active,
            expires_at: None,
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("device_id", &self.device_id)
            .field("secret", &"<redacted>")
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A reading exactly as delivered to the ingest entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    /// Client-reported timestamp (unix seconds)
    pub timestamp: i64,
    pub sequence: u64,
    /// Hex-encoded HMAC-SHA256 tag
    pub auth_tag: String,
}

/// An authenticated, validated reading. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: i64,
    pub sequence: u64,
    /// Edge arrival time (unix seconds)
    pub received_at: i64,
    /// Value crossed the metric's alert threshold
    pub is_alert: bool,
}

impl Reading {
    pub fn identity(&self) -> ReadingId {
        ReadingId {
            device_id: self.device_id.clone(),
            sequence: self.sequence,
        }
    }
}

/// Reading identity: (device, sequence)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingId {
    pub device_id: String,
    pub sequence: u64,
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.sequence)
    }
}

/// Identity of an aggregation bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub device_id: String,
    pub metric: String,
    pub window_start: i64,
    pub window_size: i64,
}

impl WindowKey {
    /// Bucket containing `timestamp` for a fixed window size
    pub fn containing(device_id: &str, metric: &str, timestamp: i64, window_size: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            metric: metric.to_string(),
            window_start: timestamp.saturating_sub(timestamp.rem_euclid(window_size)),
            window_size,
        }
    }

    /// Exclusive end of the window span
    pub fn window_end(&self) -> i64 {
        self.window_start.saturating_add(self.window_size)
    }

    pub fn storage_key(&self) -> String {
        format!("{}|{}|{}", self.device_id, self.metric, self.window_start)
    }
}

/// Persisted view of a window at a point in rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub key: WindowKey,
    pub accumulator: Accumulator,
    /// Number of readings applied; newer versions replace older ones
    pub version: u64,
    pub last_sequence: u64,
    pub closed: bool,
    pub updated_at: i64,
}

impl AggregateSnapshot {
    pub fn summary(&self) -> AggregateSummary {
        self.accumulator.summary()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    Reading,
    Snapshot,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::Reading => "reading",
            DeadLetterKind::Snapshot => "snapshot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reading" => Some(DeadLetterKind::Reading),
            "snapshot" => Some(DeadLetterKind::Snapshot),
            _ => None,
        }
    }
}

/// Durable record of a write that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub kind: DeadLetterKind,
    pub entity_key: String,
    pub device_id: String,
    pub reason: String,
    pub retry_count: u32,
    /// JSON of the `Reading` or `AggregateSnapshot` that failed
    pub payload: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeadLetter {
    pub fn for_reading(
        reading: &Reading,
        reason: impl Into<String>,
        retry_count: u32,
        now: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: DeadLetterKind::Reading,
            entity_key: reading.identity().to_string(),
            device_id: reading.device_id.clone(),
            reason: reason.into(),
            retry_count,
            payload: serde_json::to_string(reading)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn for_snapshot(
        snapshot: &AggregateSnapshot,
        reason: impl Into<String>,
        retry_count: u32,
        now: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: DeadLetterKind::Snapshot,
            entity_key: snapshot.key.storage_key(),
            device_id: snapshot.key.device_id.clone(),
            reason: reason.into(),
            retry_count,
            payload: serde_json::to_string(snapshot)?,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Non-fatal signal that a device skipped sequence numbers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSignal {
    pub device_id: String,
    pub expected: u64,
    pub received: u64,
    pub detected_at: i64,
}

/// Why a reading was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownDevice,
    Revoked,
    Expired,
    MalformedTag,
    TagMismatch,
    InvalidReading(String),
    /// Older than the lateness window on arrival
    TooOld,
    /// Sequence was already skipped past by a gap release
    Late,
    Timeout,
    ShuttingDown,
    DeviceStoreUnavailable,
}

impl RejectReason {
    /// The caller may resubmit the same reading later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectReason::Timeout | RejectReason::ShuttingDown | RejectReason::DeviceStoreUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnknownDevice => "unknown_device",
            RejectReason::Revoked => "revoked",
            RejectReason::Expired => "expired",
            RejectReason::MalformedTag => "malformed_tag",
            RejectReason::TagMismatch => "tag_mismatch",
            RejectReason::InvalidReading(_) => "invalid_reading",
            RejectReason::TooOld => "too_old",
            RejectReason::Late => "late",
            RejectReason::Timeout => "timeout",
            RejectReason::ShuttingDown => "shutting_down",
            RejectReason::DeviceStoreUnavailable => "device_store_unavailable",
        }
    }
}

impl From<&AuthError> for RejectReason {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::UnknownDevice(_) => RejectReason::UnknownDevice,
            AuthError::Revoked(_) => RejectReason::Revoked,
            AuthError::Expired { .. } => RejectReason::Expired,
            AuthError::MalformedTag(_) => RejectReason::MalformedTag,
            AuthError::TagMismatch(_) => RejectReason::TagMismatch,
        }
    }
}

/// Note attached to a successful outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestNote {
    /// Identity already accepted; nothing was written
    Duplicate,
    /// Released past a sequence gap
    GapDetected { expected: u64, received: u64 },
}

/// Result reported to the ingest caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Persisted { note: Option<IngestNote> },
    Rejected(RejectReason),
    DeadLettered { reason: String, retry_count: u32 },
    Backpressure,
}

impl IngestOutcome {
    pub fn persisted() -> Self {
        IngestOutcome::Persisted { note: None }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, IngestOutcome::Persisted { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Persisted {
                note: Some(IngestNote::Duplicate)
            }
        )
    }
}

/// Per-reading lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadingState {
    Received,
    Verified,
    Buffered,
    Ordered,
    Aggregated,
    Persisted,
    Rejected,
    DeadLettered,
}

impl ReadingState {
    fn rank(self) -> u8 {
        match self {
            ReadingState::Received => 0,
            ReadingState::Verified => 1,
            ReadingState::Buffered => 2,
            ReadingState::Ordered => 3,
            ReadingState::Aggregated => 4,
            ReadingState::Persisted | ReadingState::Rejected | ReadingState::DeadLettered => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReadingState::Persisted | ReadingState::Rejected | ReadingState::DeadLettered
        )
    }

    /// Transitions only move forward; terminal states are final.
    ///
    /// - `Rejected` is reachable up to `Buffered` (verification or ordering failure)
    /// - `Persisted` from `Ordered` (duplicate no-op) or `Aggregated`
    /// - `DeadLettered` only from `Aggregated`
    pub fn can_transition_to(self, next: ReadingState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ReadingState::Rejected => self.rank() <= ReadingState::Buffered.rank(),
            ReadingState::Persisted => {
                matches!(self, ReadingState::Ordered | ReadingState::Aggregated)
            }
            ReadingState::DeadLettered => self == ReadingState::Aggregated,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// Tracks one in-flight reading through the state machine
#[derive(Debug, Clone)]
pub struct ReadingLifecycle {
    id: ReadingId,
    state: ReadingState,
}

impl ReadingLifecycle {
    pub fn new(id: ReadingId) -> Self {
        Self {
            id,
            state: ReadingState::Received,
        }
    }

    pub fn id(&self) -> &ReadingId {
        &self.id
    }

    pub fn state(&self) -> ReadingState {
        self.state
    }

    pub fn advance(&mut self, next: ReadingState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("{}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> ReadingLifecycle {
        ReadingLifecycle::new(ReadingId {
            device_id: "D1".to_string(),
            sequence: 1,
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut lc = lifecycle();
        for state in [
            ReadingState::Verified,
            ReadingState::Buffered,
            ReadingState::Ordered,
            ReadingState::Aggregated,
            ReadingState::Persisted,
        ] {
            lc.advance(state).unwrap();
        }
        assert_eq!(lc.state(), ReadingState::Persisted);
    }

    #[test]
    fn test_transitions_never_go_backwards() {
        let mut lc = lifecycle();
        lc.advance(ReadingState::Verified).unwrap();
        lc.advance(ReadingState::Buffered).unwrap();
        assert!(lc.advance(ReadingState::Verified).is_err());
        assert!(lc.advance(ReadingState::Aggregated).is_err());
        assert_eq!(lc.state(), ReadingState::Buffered);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut lc = lifecycle();
        lc.advance(ReadingState::Rejected).unwrap();
        assert!(lc.advance(ReadingState::Verified).is_err());
        assert!(lc.advance(ReadingState::Persisted).is_err());
    }

    #[test]
    fn test_rejection_and_dead_letter_boundaries() {
        assert!(ReadingState::Buffered.can_transition_to(ReadingState::Rejected));
        assert!(!ReadingState::Ordered.can_transition_to(ReadingState::Rejected));
        assert!(ReadingState::Aggregated.can_transition_to(ReadingState::DeadLettered));
        assert!(!ReadingState::Buffered.can_transition_to(ReadingState::DeadLettered));
        assert!(ReadingState::Ordered.can_transition_to(ReadingState::Persisted));
    }

    #[test]
    fn test_window_key_alignment() {
        let key = WindowKey::containing("D1", "fill_level", 1_000_123, 300);
        assert_eq!(key.window_start, 999_900);
        assert_eq!(key.window_end(), 1_000_200);

        // Negative timestamps floor, not truncate
        let key = WindowKey::containing("D1", "fill_level", -1, 300);
        assert_eq!(key.window_start, -300);

        // Bounds of the timestamp range saturate instead of overflowing
        let key = WindowKey::containing("D1", "fill_level", i64::MAX - 5, 300);
        assert_eq!(key.window_end(), i64::MAX);
        let key = WindowKey::containing("D1", "fill_level", i64::MIN, 300);
        assert_eq!(key.window_start, i64::MIN);
    }

    #[test]
    fn test_device_record_debug_redacts_secret() {
        let record = DeviceRecord::active("D1", b"super-secret");
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
