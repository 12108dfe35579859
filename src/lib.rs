//! Edge telemetry ingestion for smart waste containers.
//!
//! See [`pipeline`] for the ingestion flow.

pub mod pipeline;
