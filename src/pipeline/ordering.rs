//! Per-device ordering engine
//!
//! Releases readings to aggregation in strictly increasing sequence order.
//! Out-of-order readings are held until the missing sequence arrives, the
//! gap grows past `max_gap`, or the held reading has waited for the full
//! lateness bound. Releasing past a hole records the skipped range and
//! emits a `GapSignal`; anything later arriving for that range is `Late`.

use super::buffer::BufferEntry;
use super::types::GapSignal;
use std::collections::{BTreeMap, VecDeque};

/// Sequence expected from a device with no history
pub const FIRST_SEQUENCE: u64 = 1;

/// Skipped ranges remembered per device
const MAX_SKIPPED_RANGES: usize = 64;

#[derive(Debug)]
struct Held<T> {
    entry: BufferEntry<T>,
    held_since: i64,
}

/// A reading released for aggregation
#[derive(Debug)]
pub struct Released<T> {
    pub entry: BufferEntry<T>,
    /// Set when this reading was released past a hole
    pub gap: Option<GapSignal>,
}

#[derive(Debug)]
pub struct OrderingOutput<T> {
    pub accepted: Vec<Released<T>>,
    pub duplicates: Vec<BufferEntry<T>>,
    pub late: Vec<BufferEntry<T>>,
    pub gaps: Vec<GapSignal>,
}

impl<T> Default for OrderingOutput<T> {
    fn default() -> Self {
        Self {
            accepted: Vec::new(),
            duplicates: Vec::new(),
            late: Vec::new(),
            gaps: Vec::new(),
        }
    }
}

impl<T> OrderingOutput<T> {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.duplicates.is_empty() && self.late.is_empty()
    }
}

#[derive(Debug)]
pub struct OrderingEngine<T> {
    device_id: String,
    last_applied: Option<u64>,
    pending: BTreeMap<u64, Held<T>>,
    /// Inclusive ranges released past without their readings
    skipped: VecDeque<(u64, u64)>,
    max_gap: u64,
    lateness_secs: i64,
}

impl<T> OrderingEngine<T> {
    /// `last_applied` is the highest sequence already persisted for the device
    pub fn new(
        device_id: impl Into<String>,
        last_applied: Option<u64>,
        max_gap: u64,
        lateness_secs: i64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            last_applied,
            pending: BTreeMap::new(),
            skipped: VecDeque::new(),
            max_gap,
            lateness_secs,
        }
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn held_len(&self) -> usize {
        self.pending.len()
    }

    fn expected(&self) -> u64 {
        self.last_applied
            .map(|last| last.saturating_add(1))
            .unwrap_or(FIRST_SEQUENCE)
    }

    fn is_skipped(&self, sequence: u64) -> bool {
        self.skipped
            .iter()
            .any(|(from, to)| (*from..=*to).contains(&sequence))
    }

    fn record_skipped(&mut self, from: u64, to: u64) {
        if self.skipped.len() >= MAX_SKIPPED_RANGES {
            self.skipped.pop_front();
        }
        self.skipped.push_back((from, to));
    }

    /// Classify a batch of entries and release whatever is now in order
    pub fn process(&mut self, entries: Vec<BufferEntry<T>>, now: i64) -> OrderingOutput<T> {
        let mut output = OrderingOutput::default();

        for entry in entries {
            let sequence = entry.reading.sequence;

            if matches!(self.last_applied, Some(last) if sequence <= last) {
                if self.is_skipped(sequence) {
                    log::debug!("⏰ {}/{} arrived after its gap was released", self.device_id, sequence);
                    output.late.push(entry);
                } else {
                    output.duplicates.push(entry);
                }
                continue;
            }

            if self.pending.contains_key(&sequence) {
                // First arrival wins
                output.duplicates.push(entry);
                continue;
            }

            self.pending.insert(
                sequence,
                Held {
                    entry,
                    held_since: now,
                },
            );
        }

        self.release(now, &mut output);
        output
    }

    fn release(&mut self, now: i64, output: &mut OrderingOutput<T>) {
        loop {
            let expected = self.expected();
            let Some((sequence, held_since)) = self
                .pending
                .iter()
                .next()
                .map(|(seq, held)| (*seq, held.held_since))
            else {
                break;
            };

            let in_order = sequence == expected
                || (self.last_applied.is_none() && sequence < expected);

            if in_order {
                if let Some(held) = self.pending.remove(&sequence) {
                    self.last_applied = Some(sequence);
                    output.accepted.push(Released {
                        entry: held.entry,
                        gap: None,
                    });
                }
                continue;
            }

            let gap_len = sequence - expected;
            let waited = now - held_since;
            if gap_len <= self.max_gap && waited < self.lateness_secs {
                break;
            }

            let signal = GapSignal {
                device_id: self.device_id.clone(),
                expected,
                received: sequence,
                detected_at: now,
            };
            log::warn!(
                "⚠️  Sequence gap on {}: expected {}, releasing {} ({} missing, held {}s)",
                self.device_id,
                expected,
                sequence,
                gap_len,
                waited
            );

            self.record_skipped(expected, sequence - 1);
            if let Some(held) = self.pending.remove(&sequence) {
                self.last_applied = Some(sequence);
                output.gaps.push(signal.clone());
                output.accepted.push(Released {
                    entry: held.entry,
                    gap: Some(signal),
                });
            }
        }
    }

    /// Remove every held reading (shutdown)
    pub fn drain_held(&mut self) -> Vec<BufferEntry<T>> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|held| held.entry)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Reading;

    fn entry(sequence: u64) -> BufferEntry<u64> {
        BufferEntry {
            reading: Reading {
                device_id: "D1".to_string(),
                metric: "fill_level".to_string(),
                value: sequence as f64,
                timestamp: 1_000,
                sequence,
                received_at: 1_000,
                is_alert: false,
            },
            ticket: sequence,
            enqueued_at: 1_000,
        }
    }

    fn batch(sequences: &[u64]) -> Vec<BufferEntry<u64>> {
        sequences.iter().map(|s| entry(*s)).collect()
    }

    fn accepted(output: &OrderingOutput<u64>) -> Vec<u64> {
        output.accepted.iter().map(|r| r.entry.ticket).collect()
    }

    #[test]
    fn test_reorders_within_batch() {
        let mut engine = OrderingEngine::new("D1", None, 100, 120);
        let output = engine.process(batch(&[1, 2, 4, 3]), 1_000);
        assert_eq!(accepted(&output), vec![1, 2, 3, 4]);
        assert!(output.gaps.is_empty());
        assert_eq!(engine.last_applied(), Some(4));
    }

    #[test]
    fn test_holds_until_missing_sequence_arrives() {
        let mut engine = OrderingEngine::new("D1", None, 100, 120);

        let output = engine.process(batch(&[1, 3]), 1_000);
        assert_eq!(accepted(&output), vec![1]);
        assert_eq!(engine.held_len(), 1);

        let output = engine.process(batch(&[2]), 1_010);
        assert_eq!(accepted(&output), vec![2, 3]);
        assert_eq!(engine.held_len(), 0);
    }

    #[test]
    fn test_duplicates_detected() {
        let mut engine = OrderingEngine::new("D1", Some(5), 100, 120);

        let output = engine.process(batch(&[5, 6, 6, 3]), 1_000);
        assert_eq!(accepted(&output), vec![6]);
        let dups: Vec<_> = output.duplicates.iter().map(|e| e.ticket).collect();
        assert_eq!(dups, vec![5, 6, 3]);
    }

    #[test]
    fn test_large_gap_released_with_signal() {
        let mut engine = OrderingEngine::new("D1", Some(10), 5, 120);

        let output = engine.process(batch(&[20]), 1_000);
        assert_eq!(accepted(&output), vec![20]);
        assert_eq!(output.gaps.len(), 1);
        assert_eq!(output.gaps[0].expected, 11);
        assert_eq!(output.gaps[0].received, 20);
        assert!(output.accepted[0].gap.is_some());

        // A reading from inside the released range is late, not duplicate
        let output = engine.process(batch(&[15]), 1_001);
        assert_eq!(output.late.len(), 1);
        assert!(output.duplicates.is_empty());
    }

    #[test]
    fn test_small_gap_released_after_lateness() {
        let mut engine = OrderingEngine::new("D1", Some(1), 100, 120);

        let output = engine.process(batch(&[3]), 1_000);
        assert!(output.accepted.is_empty());

        // An empty flush still re-checks what is held
        assert!(engine.process(Vec::new(), 1_119).accepted.is_empty());

        let output = engine.process(Vec::new(), 1_120);
        assert_eq!(accepted(&output), vec![3]);
        assert_eq!(output.gaps[0].expected, 2);
    }

    #[test]
    fn test_fresh_device_starts_at_first_sequence() {
        let mut engine = OrderingEngine::new("D1", None, 100, 120);
        let output = engine.process(batch(&[2]), 1_000);
        assert!(output.accepted.is_empty());

        let output = engine.process(batch(&[1]), 1_001);
        assert_eq!(accepted(&output), vec![1, 2]);

        // Sequence zero from a fresh device is taken as-is
        let mut engine = OrderingEngine::new("D2", None, 100, 120);
        let output = engine.process(batch(&[0, 1]), 1_000);
        assert_eq!(accepted(&output), vec![0, 1]);
    }

    #[test]
    fn test_drain_held() {
        let mut engine = OrderingEngine::new("D1", Some(1), 100, 120);
        engine.process(batch(&[4, 3]), 1_000);
        let held: Vec<_> = engine.drain_held().into_iter().map(|e| e.ticket).collect();
        assert_eq!(held, vec![3, 4]);
        assert_eq!(engine.held_len(), 0);
    }
}
