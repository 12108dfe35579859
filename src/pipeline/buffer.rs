//! Per-device ingestion buffer
//!
//! Bounded FIFO of verified readings waiting for the next flush. Each entry
//! carries a ticket (the coordinator's reply handle) so outcomes can be
//! reported back once the reading settles.

use super::types::Reading;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct BufferEntry<T> {
    pub reading: Reading,
    pub ticket: T,
    /// Edge time the entry was buffered (unix seconds)
    pub enqueued_at: i64,
}

/// Accepted into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Size threshold reached, a flush should be scheduled
    FlushDue,
}

/// Refused at the door; the ticket is dropped with the reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejection {
    Full,
    /// Client timestamp already outside the lateness bound
    TooOld,
}

/// Result of draining the buffer for a flush
#[derive(Debug)]
pub struct Drained<T> {
    pub ready: Vec<BufferEntry<T>>,
    /// Entries that aged past the lateness bound while waiting
    pub late: Vec<BufferEntry<T>>,
}

#[derive(Debug)]
pub struct IngestionBuffer<T> {
    entries: VecDeque<BufferEntry<T>>,
    max_entries: usize,
    flush_threshold: usize,
    lateness_secs: i64,
}

impl<T> IngestionBuffer<T> {
    pub fn new(max_entries: usize, flush_threshold: usize, lateness_secs: i64) -> Self {
        Self {
            entries: VecDeque::with_capacity(flush_threshold.min(max_entries)),
            max_entries,
            flush_threshold,
            lateness_secs,
        }
    }

    fn is_too_old(&self, reading: &Reading, now: i64) -> bool {
        now.saturating_sub(reading.timestamp) > self.lateness_secs
    }

    pub fn enqueue(
        &mut self,
        reading: Reading,
        ticket: T,
        now: i64,
    ) -> Result<Enqueued, EnqueueRejection> {
        if self.is_too_old(&reading, now) {
            return Err(EnqueueRejection::TooOld);
        }
        if self.entries.len() >= self.max_entries {
            return Err(EnqueueRejection::Full);
        }

        self.entries.push_back(BufferEntry {
            reading,
            ticket,
            enqueued_at: now,
        });

        if self.entries.len() >= self.flush_threshold {
            Ok(Enqueued::FlushDue)
        } else {
            Ok(Enqueued::Queued)
        }
    }

    /// Take everything buffered, splitting off entries that became too old
    pub fn drain(&mut self, now: i64) -> Drained<T> {
        let mut ready = Vec::with_capacity(self.entries.len());
        let mut late = Vec::new();

        while let Some(entry) = self.entries.pop_front() {
            if self.is_too_old(&entry.reading, now) {
                late.push(entry);
            } else {
                ready.push(entry);
            }
        }

        Drained { ready, late }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }
}
