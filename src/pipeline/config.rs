//! Pipeline configuration from environment variables

use super::accumulator::AccumulatorKind;
use super::error::ConfigError;
use super::retry::RetryPolicy;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_METRIC_POLICIES: &str =
    "fill_level=stats:0:100:90,battery_level=min:0:100,temperature=stats";

/// Per-metric aggregation and validation policy
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPolicy {
    pub accumulator: AccumulatorKind,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    /// Values at or above this are flagged as alerts
    pub alert_threshold: Option<f64>,
}

impl MetricPolicy {
    pub fn with_accumulator(accumulator: AccumulatorKind) -> Self {
        Self {
            accumulator,
            min_value: None,
            max_value: None,
            alert_threshold: None,
        }
    }
}

/// Metric policies selected at startup
///
/// Format: `metric=kind[:min[:max[:alert]]]`, comma separated. Empty fields
/// mean "unset", e.g. `temperature=stats::60:55`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPolicies {
    default_accumulator: AccumulatorKind,
    policies: HashMap<String, MetricPolicy>,
}

impl Default for MetricPolicies {
    fn default() -> Self {
        Self {
            default_accumulator: AccumulatorKind::Stats,
            policies: HashMap::new(),
        }
    }
}

impl MetricPolicies {
    pub fn new(default_accumulator: AccumulatorKind) -> Self {
        Self {
            default_accumulator,
            policies: HashMap::new(),
        }
    }

    pub fn parse(spec: &str, default_accumulator: AccumulatorKind) -> Result<Self, ConfigError> {
        let mut policies = Self::new(default_accumulator);

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (metric, rest) = entry.split_once('=').ok_or_else(|| invalid_policy(entry))?;
            let metric = metric.trim();
            if metric.is_empty() {
                return Err(invalid_policy(entry));
            }

            let mut fields = rest.split(':');
            let accumulator = fields
                .next()
                .and_then(AccumulatorKind::from_str)
                .ok_or_else(|| invalid_policy(entry))?;
            let min_value = parse_bound(fields.next(), entry)?;
            let max_value = parse_bound(fields.next(), entry)?;
            let alert_threshold = parse_bound(fields.next(), entry)?;
            if fields.next().is_some() {
                return Err(invalid_policy(entry));
            }

            if let (Some(lo), Some(hi)) = (min_value, max_value) {
                if lo > hi {
                    return Err(invalid_policy(entry));
                }
            }

            policies.insert(
                metric,
                MetricPolicy {
                    accumulator,
                    min_value,
                    max_value,
                    alert_threshold,
                },
            );
        }

        Ok(policies)
    }

    pub fn insert(&mut self, metric: &str, policy: MetricPolicy) {
        self.policies.insert(metric.to_string(), policy);
    }

    pub fn policy_for(&self, metric: &str) -> MetricPolicy {
        self.policies
            .get(metric)
            .cloned()
            .unwrap_or_else(|| MetricPolicy::with_accumulator(self.default_accumulator))
    }

    pub fn accumulator_for(&self, metric: &str) -> AccumulatorKind {
        self.policies
            .get(metric)
            .map(|p| p.accumulator)
            .unwrap_or(self.default_accumulator)
    }

    /// Range check, returns a human-readable reason on failure
    pub fn validate(&self, metric: &str, value: f64) -> Result<(), String> {
        if !value.is_finite() {
            return Err(format!("{} value must be finite, got {}", metric, value));
        }
        let policy = self.policy_for(metric);
        if let Some(min) = policy.min_value {
            if value < min {
                return Err(format!("{} value {} below minimum {}", metric, value, min));
            }
        }
        if let Some(max) = policy.max_value {
            if value > max {
                return Err(format!("{} value {} above maximum {}", metric, value, max));
            }
        }
        Ok(())
    }

    pub fn is_alert(&self, metric: &str, value: f64) -> bool {
        self.policies
            .get(metric)
            .and_then(|p| p.alert_threshold)
            .map(|threshold| value >= threshold)
            .unwrap_or(false)
    }
}

fn invalid_policy(entry: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: "METRIC_POLICIES".to_string(),
        message: format!("cannot parse '{}'", entry),
    }
}

fn parse_bound(field: Option<&str>, entry: &str) -> Result<Option<f64>, ConfigError> {
    match field.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid_policy(entry)),
    }
}

/// Configuration for the edge pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Aggregation window span (seconds)
    pub window_size_secs: i64,

    /// Time after a window's end before it closes (seconds)
    pub window_grace_secs: i64,

    /// Maximum tolerated delay between a reading's timestamp and its arrival,
    /// also the longest a reading is held waiting for a missing sequence
    pub lateness_secs: i64,

    /// How far a reading's timestamp may run ahead of the edge clock
    pub max_clock_skew_secs: i64,

    /// Per-device buffer bound
    pub buffer_max_entries: usize,

    /// Buffer size that triggers an immediate flush
    pub buffer_flush_threshold: usize,

    /// Periodic flush tick in milliseconds
    pub flush_interval_ms: u64,

    /// Sequence gap above which held readings are released immediately
    pub max_sequence_gap: u64,

    /// Retries after the first persistence attempt
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Timeout for a single stage call (device lookup, one storage write)
    pub stage_timeout_ms: u64,

    /// Longest a caller waits for a terminal outcome
    pub ingest_timeout_ms: u64,

    /// Consecutive dead-lettered persists that throttle a device
    pub backpressure_failure_threshold: u32,
    pub backpressure_cooldown_ms: u64,

    /// Global bound on buffered + held readings
    pub max_in_flight: usize,

    pub metric_policies: MetricPolicies,

    /// Cloud sync outbox cycle in milliseconds
    pub sync_interval_ms: u64,
    pub sync_outbox_path: String,

    /// Dead-letter reconciliation cycle in milliseconds
    pub dead_letter_replay_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/wasteflow/wasteflow.db".to_string(),
            window_size_secs: 300,
            window_grace_secs: 60,
            lateness_secs: 120,
            max_clock_skew_secs: 300,
            buffer_max_entries: 256,
            buffer_flush_threshold: 32,
            flush_interval_ms: 1_000,
            max_sequence_gap: 100,
            retry_max_attempts: 5,
            retry_initial_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            stage_timeout_ms: 2_000,
            ingest_timeout_ms: 150_000,
            backpressure_failure_threshold: 3,
            backpressure_cooldown_ms: 10_000,
            max_in_flight: 10_000,
            metric_policies: MetricPolicies::parse(DEFAULT_METRIC_POLICIES, AccumulatorKind::Stats)
                .unwrap_or_default(),
            sync_interval_ms: 60_000,
            sync_outbox_path: "/var/lib/wasteflow/outbox".to_string(),
            dead_letter_replay_interval_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `WASTEFLOW_DB_PATH` (default: /var/lib/wasteflow/wasteflow.db)
    /// - `WINDOW_SIZE_SECS` (default: 300)
    /// - `WINDOW_GRACE_SECS` (default: 60)
    /// - `LATENESS_SECS` (default: 120)
    /// - `MAX_CLOCK_SKEW_SECS` (default: 300)
    /// - `BUFFER_MAX_ENTRIES` (default: 256)
    /// - `BUFFER_FLUSH_THRESHOLD` (default: 32)
    /// - `FLUSH_INTERVAL_MS` (default: 1000)
    /// - `MAX_SEQUENCE_GAP` (default: 100)
    /// - `RETRY_MAX_ATTEMPTS` (default: 5)
    /// - `RETRY_INITIAL_DELAY_MS` (default: 50)
    /// - `RETRY_MAX_DELAY_MS` (default: 2000)
    /// - `STAGE_TIMEOUT_MS` (default: 2000)
    /// - `INGEST_TIMEOUT_MS` (default: 150000)
    /// - `BACKPRESSURE_FAILURE_THRESHOLD` (default: 3)
    /// - `BACKPRESSURE_COOLDOWN_MS` (default: 10000)
    /// - `MAX_IN_FLIGHT` (default: 10000)
    /// - `METRIC_POLICIES` (default: fill_level=stats:0:100:90,battery_level=min:0:100,temperature=stats)
    /// - `DEFAULT_ACCUMULATOR` (default: stats)
    /// - `SYNC_INTERVAL_MS` (default: 60000)
    /// - `SYNC_OUTBOX_PATH` (default: /var/lib/wasteflow/outbox)
    /// - `DEAD_LETTER_REPLAY_INTERVAL_MS` (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_accumulator = match env::var("DEFAULT_ACCUMULATOR") {
            Ok(raw) => AccumulatorKind::from_str(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "DEFAULT_ACCUMULATOR".to_string(),
                message: format!("unknown accumulator '{}'", raw),
            })?,
            Err(_) => AccumulatorKind::Stats,
        };

        let policy_spec =
            env::var("METRIC_POLICIES").unwrap_or_else(|_| DEFAULT_METRIC_POLICIES.to_string());
        let metric_policies = MetricPolicies::parse(&policy_spec, default_accumulator)?;

        let config = Self {
            db_path: env::var("WASTEFLOW_DB_PATH").unwrap_or(defaults.db_path),
            window_size_secs: env_or("WINDOW_SIZE_SECS", defaults.window_size_secs),
            window_grace_secs: env_or("WINDOW_GRACE_SECS", defaults.window_grace_secs),
            lateness_secs: env_or("LATENESS_SECS", defaults.lateness_secs),
            max_clock_skew_secs: env_or("MAX_CLOCK_SKEW_SECS", defaults.max_clock_skew_secs),
            buffer_max_entries: env_or("BUFFER_MAX_ENTRIES", defaults.buffer_max_entries),
            buffer_flush_threshold: env_or("BUFFER_FLUSH_THRESHOLD", defaults.buffer_flush_threshold),
            flush_interval_ms: env_or("FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
            max_sequence_gap: env_or("MAX_SEQUENCE_GAP", defaults.max_sequence_gap),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_initial_delay_ms: env_or("RETRY_INITIAL_DELAY_MS", defaults.retry_initial_delay_ms),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            stage_timeout_ms: env_or("STAGE_TIMEOUT_MS", defaults.stage_timeout_ms),
            ingest_timeout_ms: env_or("INGEST_TIMEOUT_MS", defaults.ingest_timeout_ms),
            backpressure_failure_threshold: env_or(
                "BACKPRESSURE_FAILURE_THRESHOLD",
                defaults.backpressure_failure_threshold,
            ),
            backpressure_cooldown_ms: env_or(
                "BACKPRESSURE_COOLDOWN_MS",
                defaults.backpressure_cooldown_ms,
            ),
            max_in_flight: env_or("MAX_IN_FLIGHT", defaults.max_in_flight),
            metric_policies,
            sync_interval_ms: env_or("SYNC_INTERVAL_MS", defaults.sync_interval_ms),
            sync_outbox_path: env::var("SYNC_OUTBOX_PATH").unwrap_or(defaults.sync_outbox_path),
            dead_letter_replay_interval_ms: env_or(
                "DEAD_LETTER_REPLAY_INTERVAL_MS",
                defaults.dead_letter_replay_interval_ms,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("WINDOW_SIZE_SECS", self.window_size_secs > 0),
            ("LATENESS_SECS", self.lateness_secs > 0),
            ("WINDOW_GRACE_SECS", self.window_grace_secs >= 0),
            ("MAX_CLOCK_SKEW_SECS", self.max_clock_skew_secs >= 0),
            ("BUFFER_MAX_ENTRIES", self.buffer_max_entries > 0),
            ("BUFFER_FLUSH_THRESHOLD", self.buffer_flush_threshold > 0),
            ("FLUSH_INTERVAL_MS", self.flush_interval_ms > 0),
            ("STAGE_TIMEOUT_MS", self.stage_timeout_ms > 0),
            ("INGEST_TIMEOUT_MS", self.ingest_timeout_ms > 0),
            ("SYNC_INTERVAL_MS", self.sync_interval_ms > 0),
            ("DEAD_LETTER_REPLAY_INTERVAL_MS", self.dead_letter_replay_interval_ms > 0),
            ("MAX_IN_FLIGHT", self.max_in_flight > 0),
        ];
        for (key, ok) in positive {
            if !ok {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            attempt_timeout: self.stage_timeout(),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest_timeout_ms)
    }

    pub fn backpressure_cooldown(&self) -> Duration {
        Duration::from_millis(self.backpressure_cooldown_ms)
    }
}

fn env_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // Test: Default configuration when no env vars set
        env::remove_var("WASTEFLOW_DB_PATH");
        env::remove_var("WINDOW_SIZE_SECS");
        env::remove_var("METRIC_POLICIES");
        env::remove_var("DEFAULT_ACCUMULATOR");

        let config = PipelineConfig::from_env().unwrap();

        assert_eq!(config.db_path, "/var/lib/wasteflow/wasteflow.db");
        assert_eq!(config.window_size_secs, 300);
        assert_eq!(config.window_grace_secs, 60);
        assert_eq!(config.lateness_secs, 120);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(
            config.metric_policies.accumulator_for("battery_level"),
            AccumulatorKind::Min
        );
        assert_eq!(
            config.metric_policies.accumulator_for("unlisted"),
            AccumulatorKind::Stats
        );
    }

    #[test]
    fn test_policy_parsing() {
        let policies =
            MetricPolicies::parse("fill_level=stats:0:100:90, weight=sum::500", AccumulatorKind::Count)
                .unwrap();

        let fill = policies.policy_for("fill_level");
        assert_eq!(fill.accumulator, AccumulatorKind::Stats);
        assert_eq!(fill.min_value, Some(0.0));
        assert_eq!(fill.max_value, Some(100.0));
        assert_eq!(fill.alert_threshold, Some(90.0));

        let weight = policies.policy_for("weight");
        assert_eq!(weight.accumulator, AccumulatorKind::Sum);
        assert_eq!(weight.min_value, None);
        assert_eq!(weight.max_value, Some(500.0));

        assert_eq!(policies.accumulator_for("other"), AccumulatorKind::Count);
    }

    #[test]
    fn test_policy_parsing_rejects_garbage() {
        assert!(MetricPolicies::parse("fill_level", AccumulatorKind::Stats).is_err());
        assert!(MetricPolicies::parse("fill_level=median", AccumulatorKind::Stats).is_err());
        assert!(MetricPolicies::parse("fill_level=stats:abc", AccumulatorKind::Stats).is_err());
        assert!(MetricPolicies::parse("fill_level=stats:10:5", AccumulatorKind::Stats).is_err());
        assert!(MetricPolicies::parse("=stats", AccumulatorKind::Stats).is_err());
    }

    #[test]
    fn test_validation_and_alerts() {
        let policies =
            MetricPolicies::parse("fill_level=stats:0:100:90", AccumulatorKind::Stats).unwrap();

        assert!(policies.validate("fill_level", 55.0).is_ok());
        assert!(policies.validate("fill_level", 101.0).is_err());
        assert!(policies.validate("fill_level", -0.5).is_err());
        assert!(policies.validate("anything", f64::NAN).is_err());
        assert!(policies.validate("anything", 1e9).is_ok());

        assert!(policies.is_alert("fill_level", 90.0));
        assert!(!policies.is_alert("fill_level", 89.9));
        assert!(!policies.is_alert("temperature", 1000.0));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = PipelineConfig {
            window_size_secs: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_timeouts() {
        let cases: [(&str, fn(&mut PipelineConfig)); 4] = [
            ("STAGE_TIMEOUT_MS", |c| c.stage_timeout_ms = 0),
            ("SYNC_INTERVAL_MS", |c| c.sync_interval_ms = 0),
            ("DEAD_LETTER_REPLAY_INTERVAL_MS", |c| c.dead_letter_replay_interval_ms = 0),
            ("MAX_CLOCK_SKEW_SECS", |c| c.max_clock_skew_secs = -1),
        ];

        for (key, tweak) in cases {
            let mut config = PipelineConfig::default();
            tweak(&mut config);
            match config.validate() {
                Err(ConfigError::InvalidValue { key: rejected, .. }) => assert_eq!(rejected, key),
                Ok(()) => panic!("invalid {} should be rejected", key),
            }
        }

        assert!(PipelineConfig::default().validate().is_ok());
    }
}
