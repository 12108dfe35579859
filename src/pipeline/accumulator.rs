//! Window accumulators
//!
//! A closed set of variants selected per metric at startup. Every variant is
//! updated through `merge`, which is associative and commutative, so the
//! final state of a window does not depend on the order accepted readings
//! were applied in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorKind {
    Sum,
    Count,
    Min,
    Max,
    /// count, sum, min, max, mean and variance
    Stats,
}

impl AccumulatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccumulatorKind::Sum => "sum",
            AccumulatorKind::Count => "count",
            AccumulatorKind::Min => "min",
            AccumulatorKind::Max => "max",
            AccumulatorKind::Stats => "stats",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Some(AccumulatorKind::Sum),
            "count" => Some(AccumulatorKind::Count),
            "min" => Some(AccumulatorKind::Min),
            "max" => Some(AccumulatorKind::Max),
            "stats" => Some(AccumulatorKind::Stats),
            _ => None,
        }
    }

    /// Empty accumulator of this kind
    pub fn empty(self) -> Accumulator {
        match self {
            AccumulatorKind::Sum => Accumulator::Sum { count: 0, sum: 0.0 },
            AccumulatorKind::Count => Accumulator::Count { count: 0 },
            AccumulatorKind::Min => Accumulator::Min {
                count: 0,
                min: None,
            },
            AccumulatorKind::Max => Accumulator::Max {
                count: 0,
                max: None,
            },
            AccumulatorKind::Stats => Accumulator::Stats(RunningStats::default()),
        }
    }

    /// Accumulator holding exactly one value
    pub fn single(self, value: f64) -> Accumulator {
        match self {
            AccumulatorKind::Sum => Accumulator::Sum {
                count: 1,
                sum: value,
            },
            AccumulatorKind::Count => Accumulator::Count { count: 1 },
            AccumulatorKind::Min => Accumulator::Min {
                count: 1,
                min: Some(value),
            },
            AccumulatorKind::Max => Accumulator::Max {
                count: 1,
                max: Some(value),
            },
            AccumulatorKind::Stats => Accumulator::Stats(RunningStats::single(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot merge {right:?} accumulator into {left:?}")]
pub struct KindMismatch {
    pub left: AccumulatorKind,
    pub right: AccumulatorKind,
}

/// Streaming mean/variance state (Welford, merged with Chan's formula)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: f64,
    pub m2: f64,
}

impl RunningStats {
    fn single(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: Some(value),
            max: Some(value),
            mean: value,
            m2: 0.0,
        }
    }

    fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;

        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = min_opt(self.min, other.min);
        self.max = max_opt(self.max, other.max);
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.m2 / self.count as f64)
        }
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Accumulator {
    Sum { count: u64, sum: f64 },
    Count { count: u64 },
    Min { count: u64, min: Option<f64> },
    Max { count: u64, max: Option<f64> },
    Stats(RunningStats),
}

/// Flattened view of an accumulator for storage and queries.
/// Fields a variant does not track are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub count: u64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
}

impl Accumulator {
    pub fn kind(&self) -> AccumulatorKind {
        match self {
            Accumulator::Sum { .. } => AccumulatorKind::Sum,
            Accumulator::Count { .. } => AccumulatorKind::Count,
            Accumulator::Min { .. } => AccumulatorKind::Min,
            Accumulator::Max { .. } => AccumulatorKind::Max,
            Accumulator::Stats(_) => AccumulatorKind::Stats,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Accumulator::Sum { count, .. }
            | Accumulator::Count { count }
            | Accumulator::Min { count, .. }
            | Accumulator::Max { count, .. } => *count,
            Accumulator::Stats(stats) => stats.count,
        }
    }

    /// Fold one value in
    pub fn update(&mut self, value: f64) {
        let single = self.kind().single(value);
        // Same kind by construction
        let _ = self.merge(&single);
    }

    /// Combine another accumulator of the same kind into this one
    pub fn merge(&mut self, other: &Accumulator) -> Result<(), KindMismatch> {
        match (self, other) {
            (Accumulator::Sum { count, sum }, Accumulator::Sum { count: c, sum: s }) => {
                *count += c;
                *sum += s;
            }
            (Accumulator::Count { count }, Accumulator::Count { count: c }) => {
                *count += c;
            }
            (Accumulator::Min { count, min }, Accumulator::Min { count: c, min: m }) => {
                *count += c;
                *min = min_opt(*min, *m);
            }
            (Accumulator::Max { count, max }, Accumulator::Max { count: c, max: m }) => {
                *count += c;
                *max = max_opt(*max, *m);
            }
            (Accumulator::Stats(stats), Accumulator::Stats(other_stats)) => {
                stats.merge(other_stats);
            }
            (left, right) => {
                return Err(KindMismatch {
                    left: left.kind(),
                    right: right.kind(),
                })
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> AggregateSummary {
        match self {
            Accumulator::Sum { count, sum } => AggregateSummary {
                count: *count,
                sum: Some(*sum),
                mean: (*count > 0).then(|| sum / *count as f64),
                ..Default::default()
            },
            Accumulator::Count { count } => AggregateSummary {
                count: *count,
                ..Default::default()
            },
            Accumulator::Min { count, min } => AggregateSummary {
                count: *count,
                min: *min,
                ..Default::default()
            },
            Accumulator::Max { count, max } => AggregateSummary {
                count: *count,
                max: *max,
                ..Default::default()
            },
            Accumulator::Stats(stats) => AggregateSummary {
                count: stats.count,
                sum: Some(stats.sum),
                min: stats.min,
                max: stats.max,
                mean: (stats.count > 0).then_some(stats.mean),
                variance: stats.variance(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(kind: AccumulatorKind, values: &[f64]) -> Accumulator {
        let mut acc = kind.empty();
        for v in values {
            acc.update(*v);
        }
        acc
    }

    #[test]
    fn test_stats_scenario_values() {
        let acc = fold(AccumulatorKind::Stats, &[10.0, 20.0, 40.0, 30.0]);
        let summary = acc.summary();

        assert_eq!(summary.count, 4);
        assert_eq!(summary.sum, Some(100.0));
        assert_eq!(summary.min, Some(10.0));
        assert_eq!(summary.max, Some(40.0));
        assert_eq!(summary.mean, Some(25.0));
        assert!((summary.variance.unwrap() - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let values = [3.5, -1.0, 8.25, 0.0, 12.0, 7.0];

        for kind in [
            AccumulatorKind::Sum,
            AccumulatorKind::Count,
            AccumulatorKind::Min,
            AccumulatorKind::Max,
            AccumulatorKind::Stats,
        ] {
            let forward = fold(kind, &values);

            // Split in two partial accumulators, merge the other way round
            let mut left = fold(kind, &values[3..]);
            let right = fold(kind, &values[..3]);
            left.merge(&right).unwrap();

            let a = forward.summary();
            let b = left.summary();
            assert_eq!(a.count, b.count, "{:?}", kind);
            assert_eq!(a.min, b.min, "{:?}", kind);
            assert_eq!(a.max, b.max, "{:?}", kind);
            match (a.mean, b.mean) {
                (Some(x), Some(y)) => assert!((x - y).abs() < 1e-9, "{:?}", kind),
                (x, y) => assert_eq!(x, y),
            }
            match (a.variance, b.variance) {
                (Some(x), Some(y)) => assert!((x - y).abs() < 1e-9, "{:?}", kind),
                (x, y) => assert_eq!(x, y),
            }
        }
    }

    #[test]
    fn test_merge_rejects_kind_mismatch() {
        let mut sum = AccumulatorKind::Sum.empty();
        let err = sum.merge(&AccumulatorKind::Max.single(1.0)).unwrap_err();
        assert_eq!(err.left, AccumulatorKind::Sum);
        assert_eq!(err.right, AccumulatorKind::Max);
        assert_eq!(sum.count(), 0);
    }

    #[test]
    fn test_empty_summaries() {
        let summary = AccumulatorKind::Stats.empty().summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean, None);
        assert_eq!(summary.variance, None);
        assert_eq!(summary.min, None);
    }

    #[test]
    fn test_state_survives_json() {
        let acc = fold(AccumulatorKind::Min, &[4.0, 2.0]);
        let json = serde_json::to_string(&acc).unwrap();
        assert!(json.contains("\"kind\":\"min\""));
        let back: Accumulator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, acc);
    }
}
