//! Tumbling window state per device
//!
//! One `WindowManager` per device holds the open windows for every metric
//! the device reports. Windows close once `end + grace` has passed; a closed
//! window still takes updates until `end + lateness`, bumping its version so
//! the persisted snapshot is revised in place. After `end + max(grace,
//! lateness)` the window is dropped from memory and its snapshot is final.

use super::accumulator::Accumulator;
use super::config::MetricPolicies;
use super::types::{AggregateSnapshot, Reading, WindowKey};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct WindowState {
    accumulator: Accumulator,
    version: u64,
    last_sequence: u64,
    closed: bool,
    updated_at: i64,
}

/// What `apply` did to a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    pub key: WindowKey,
    pub version: u64,
    /// False when the reading was already folded into this window
    pub applied: bool,
}

#[derive(Debug)]
pub struct WindowManager {
    device_id: String,
    window_size: i64,
    grace_secs: i64,
    lateness_secs: i64,
    policies: Arc<MetricPolicies>,
    /// (metric, window_start) → state
    windows: BTreeMap<(String, i64), WindowState>,
}

impl WindowManager {
    pub fn new(
        device_id: impl Into<String>,
        window_size: i64,
        grace_secs: i64,
        lateness_secs: i64,
        policies: Arc<MetricPolicies>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            window_size,
            grace_secs,
            lateness_secs,
            policies,
            windows: BTreeMap::new(),
        }
    }

    fn key_for(&self, metric: &str, window_start: i64) -> WindowKey {
        WindowKey {
            device_id: self.device_id.clone(),
            metric: metric.to_string(),
            window_start,
            window_size: self.window_size,
        }
    }

    fn retention(&self) -> i64 {
        self.grace_secs.max(self.lateness_secs)
    }

    /// Whether the window containing `reading` can still change
    pub fn accepts(&self, reading: &Reading, now: i64) -> bool {
        let key = WindowKey::containing(
            &self.device_id,
            &reading.metric,
            reading.timestamp,
            self.window_size,
        );
        key.window_end().saturating_add(self.retention()) > now
    }

    /// Fold a reading into the window containing its timestamp
    pub fn apply(&mut self, reading: &Reading, now: i64) -> WindowUpdate {
        let key = WindowKey::containing(
            &self.device_id,
            &reading.metric,
            reading.timestamp,
            self.window_size,
        );
        let kind = self.policies.accumulator_for(&reading.metric);

        let state = self
            .windows
            .entry((reading.metric.clone(), key.window_start))
            .or_insert_with(|| WindowState {
                accumulator: kind.empty(),
                version: 0,
                last_sequence: 0,
                closed: false,
                updated_at: now,
            });

        if state.version > 0 && reading.sequence <= state.last_sequence {
            log::debug!(
                "🔁 {}/{} already in window {}",
                reading.device_id,
                reading.sequence,
                key.storage_key()
            );
            return WindowUpdate {
                key,
                version: state.version,
                applied: false,
            };
        }

        state.accumulator.update(reading.value);
        state.version += 1;
        state.last_sequence = reading.sequence;
        state.updated_at = now;

        if state.closed {
            log::info!(
                "📝 Late update revises closed window {} (v{})",
                key.storage_key(),
                state.version
            );
        }

        WindowUpdate {
            key,
            version: state.version,
            applied: true,
        }
    }

    pub fn snapshot(&self, key: &WindowKey) -> Option<AggregateSnapshot> {
        self.windows
            .get(&(key.metric.clone(), key.window_start))
            .map(|state| AggregateSnapshot {
                key: key.clone(),
                accumulator: state.accumulator.clone(),
                version: state.version,
                last_sequence: state.last_sequence,
                closed: state.closed,
                updated_at: state.updated_at,
            })
    }

    /// Reload a window from its persisted snapshot (startup recovery)
    pub fn restore(&mut self, snapshot: AggregateSnapshot) {
        if snapshot.key.device_id != self.device_id || snapshot.key.window_size != self.window_size
        {
            return;
        }
        self.windows.insert(
            (snapshot.key.metric, snapshot.key.window_start),
            WindowState {
                accumulator: snapshot.accumulator,
                version: snapshot.version,
                last_sequence: snapshot.last_sequence,
                closed: snapshot.closed,
                updated_at: snapshot.updated_at,
            },
        );
    }

    /// Mark windows past `end + grace` as closed and return their final snapshots
    pub fn due_for_close(&mut self, now: i64) -> Vec<AggregateSnapshot> {
        let grace = self.grace_secs;
        let window_size = self.window_size;

        let due: Vec<(String, i64)> = self
            .windows
            .iter()
            .filter(|(key, state)| !state.closed && key.1.saturating_add(window_size + grace) <= now)
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|(metric, start)| {
                let key = self.key_for(&metric, start);
                if let Some(state) = self.windows.get_mut(&(metric, start)) {
                    state.closed = true;
                    state.updated_at = now;
                }
                self.snapshot(&key)
            })
            .collect()
    }

    /// Drop windows that can no longer change; returns how many were dropped
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let horizon = self.window_size + self.retention();
        let before = self.windows.len();
        self.windows
            .retain(|&(_, start), state| !(state.closed && start.saturating_add(horizon) <= now));
        before - self.windows.len()
    }

    /// Close every open window (shutdown)
    pub fn close_all(&mut self, now: i64) -> Vec<AggregateSnapshot> {
        let keys: Vec<WindowKey> = self
            .windows
            .keys()
            .map(|(metric, start)| self.key_for(metric, *start))
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                if let Some(state) = self.windows.get_mut(&(key.metric.clone(), key.window_start)) {
                    if !state.closed {
                        state.closed = true;
                        state.updated_at = now;
                    }
                }
                self.snapshot(&key)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::accumulator::AccumulatorKind;
    use crate::pipeline::config::MetricPolicy;

    fn manager() -> WindowManager {
        let mut policies = MetricPolicies::new(AccumulatorKind::Stats);
        policies.insert("battery_level", MetricPolicy::with_accumulator(AccumulatorKind::Min));
        WindowManager::new("D1", 300, 60, 120, Arc::new(policies))
    }

    fn reading(metric: &str, sequence: u64, value: f64, timestamp: i64) -> Reading {
        Reading {
            device_id: "D1".to_string(),
            metric: metric.to_string(),
            value,
            timestamp,
            sequence,
            received_at: timestamp,
            is_alert: false,
        }
    }

    #[test]
    fn test_apply_accumulates_per_window() {
        let mut windows = manager();
        for (seq, value) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)] {
            let update = windows.apply(&reading("fill_level", seq, value, 1_000), 1_000);
            assert!(update.applied);
            assert_eq!(update.version, seq);
        }

        let key = WindowKey::containing("D1", "fill_level", 1_000, 300);
        let snapshot = windows.snapshot(&key).unwrap();
        let summary = snapshot.summary();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.sum, Some(100.0));
        assert_eq!(snapshot.last_sequence, 4);
        assert!(!snapshot.closed);
    }

    #[test]
    fn test_metric_policy_selects_accumulator() {
        let mut windows = manager();
        windows.apply(&reading("battery_level", 1, 80.0, 1_000), 1_000);
        let key = WindowKey::containing("D1", "battery_level", 1_000, 300);
        let snapshot = windows.snapshot(&key).unwrap();
        assert_eq!(snapshot.accumulator.kind(), AccumulatorKind::Min);
    }

    #[test]
    fn test_replayed_sequence_not_applied_twice() {
        let mut windows = manager();
        windows.apply(&reading("fill_level", 5, 10.0, 1_000), 1_000);
        let update = windows.apply(&reading("fill_level", 5, 10.0, 1_000), 1_001);
        assert!(!update.applied);
        assert_eq!(update.version, 1);
    }

    #[test]
    fn test_close_after_grace_and_late_revision() {
        let mut windows = manager();
        // Window [900, 1200)
        windows.apply(&reading("fill_level", 1, 10.0, 1_000), 1_000);

        assert!(windows.due_for_close(1_259).is_empty());
        let closed = windows.due_for_close(1_260);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].closed);
        assert_eq!(closed[0].version, 1);

        // Still inside the lateness bound: revised, version bumps
        let late = reading("fill_level", 2, 30.0, 1_150);
        assert!(windows.accepts(&late, 1_300));
        let update = windows.apply(&late, 1_300);
        assert_eq!(update.version, 2);
        let snapshot = windows.snapshot(&update.key).unwrap();
        assert!(snapshot.closed);

        // Not re-reported once closed
        assert!(windows.due_for_close(1_310).is_empty());

        assert_eq!(windows.evict_expired(1_319), 0);
        assert_eq!(windows.evict_expired(1_320), 1);
        assert!(!windows.accepts(&reading("fill_level", 3, 1.0, 1_150), 1_320));
    }

    #[test]
    fn test_restore_and_close_all() {
        let mut windows = manager();
        let key = WindowKey::containing("D1", "fill_level", 1_000, 300);
        let mut accumulator = AccumulatorKind::Stats.empty();
        accumulator.update(5.0);

        windows.restore(AggregateSnapshot {
            key: key.clone(),
            accumulator,
            version: 1,
            last_sequence: 7,
            closed: false,
            updated_at: 1_000,
        });

        // Sequence at or below the restored high-water mark is skipped
        let update = windows.apply(&reading("fill_level", 7, 5.0, 1_000), 1_010);
        assert!(!update.applied);

        windows.apply(&reading("fill_level", 8, 15.0, 1_000), 1_010);
        let snapshots = windows.close_all(1_020);
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].closed);
        assert_eq!(snapshots[0].version, 2);
        assert_eq!(snapshots[0].summary().sum, Some(20.0));
    }

    #[test]
    fn test_window_at_end_of_time_range() {
        let mut windows = manager();
        let far = reading("fill_level", 1, 10.0, i64::MAX - 5);
        assert!(windows.accepts(&far, 1_000));

        windows.apply(&far, 1_000);
        assert!(windows.due_for_close(i64::MAX - 1).is_empty());
        assert_eq!(windows.due_for_close(i64::MAX).len(), 1);
        assert_eq!(windows.evict_expired(i64::MAX), 1);
    }
}
