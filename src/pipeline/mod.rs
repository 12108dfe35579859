//! # Edge Telemetry Pipeline
//!
//! Ingests sensor readings from waste-container devices at the edge,
//! authenticates them, orders them per device, rolls them up into fixed
//! tumbling windows and persists both the raw readings and the window
//! snapshots to SQLite.
//!
//! ## Flow
//!
//! ```text
//! ingest() → verify → buffer → order/dedup → window apply → persist
//!                                                  ↓ (retries exhausted)
//!                                              dead_letters
//! ```
//!
//! **Key Principle:** a reading is never silently dropped. Every call to
//! `ingest` ends in exactly one of `Persisted`, `Rejected`, `DeadLettered`
//! or `Backpressure`.
//!
//! ## Schema Reference
//!
//! All tables are created from `/sql/`:
//! - `devices` → `DeviceRecord`
//! - `raw_readings` → `Reading`
//! - `aggregate_snapshots` → `AggregateSnapshot`
//! - `dead_letters` → `DeadLetter`
//! - `gap_signals` → `GapSignal`
//!
//! ## Module Organization
//!
//! - `types` - Core data structures and the reading lifecycle
//! - `error` - Error taxonomy
//! - `config` - Environment configuration and metric policies
//! - `auth` - Credential verification and device key cache
//! - `buffer` - Per-device ingestion buffer
//! - `ordering` - Deduplication and sequence ordering
//! - `accumulator` - Window accumulator variants
//! - `windows` - Per-device tumbling windows
//! - `retry` - Bounded exponential backoff
//! - `db` - Persistence gateway and SQLite store
//! - `engine` - Pipeline coordinator (ingest entry point)
//! - `ingestion` - Periodic flush / replay loop
//! - `sync` - Cloud sync outbox

pub mod accumulator;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod ordering;
pub mod retry;
pub mod sync;
pub mod types;
pub mod windows;

// Re-export commonly used types
pub use accumulator::{Accumulator, AccumulatorKind, AggregateSummary};
pub use auth::{sign_reading, DeviceKeyCache, DeviceStore, ProvisioningEvent};
pub use config::{MetricPolicies, MetricPolicy, PipelineConfig};
pub use db::{PersistenceGateway, QueryStore, SqliteStore, SyncSource};
pub use engine::{PipelineCoordinator, PipelineStats, ReplayReport, ShutdownReport};
pub use error::{AuthError, ConfigError, PipelineError, StoreError};
pub use types::{
    AggregateSnapshot, DeadLetter, DeadLetterKind, DeviceRecord, DeviceStatus, GapSignal,
    IngestNote, IngestOutcome, IngestRequest, Reading, ReadingId, ReadingState, RejectReason,
    WindowKey,
};
