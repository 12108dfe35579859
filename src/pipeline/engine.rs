//! Pipeline coordinator
//!
//! Owns the per-device sessions and drives every reading through:
//!
//! ```text
//! IngestRequest
//!     ↓ verify (key cache + HMAC)          → Rejected(auth)
//!     ↓ validate + admission               → Rejected / Backpressure
//! IngestionBuffer (per device)
//!     ↓ flush (tick or size threshold)
//! OrderingEngine                           → duplicate / late / gap signal
//!     ↓
//! WindowManager::apply
//!     ↓
//! PersistenceGateway (bounded retry)       → DeadLettered on exhaustion
//!     ↓
//! IngestOutcome sent back to the caller
//! ```
//!
//! Each device has its own worker lock, so a slow or failing device only
//! stalls itself. Only storage corruption is fatal; it is reported through
//! `fatal_error()` and the runtime stops.

use super::auth::{self, DeviceKeyCache, ProvisioningEvent};
use super::buffer::{BufferEntry, EnqueueRejection, Enqueued, IngestionBuffer};
use super::config::{MetricPolicies, PipelineConfig};
use super::db::{PersistenceGateway, QueryStore};
use super::error::PipelineError;
use super::ordering::{OrderingEngine, OrderingOutput};
use super::retry::{with_retry, RetryPolicy};
use super::types::{
    AggregateSnapshot, DeadLetter, DeadLetterKind, GapSignal, IngestNote, IngestOutcome,
    IngestRequest, Reading, ReadingId, ReadingLifecycle, ReadingState, RejectReason, WindowKey,
};
use super::windows::WindowManager;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinSet;
use tokio::time::timeout;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Slot in the global in-flight budget, released on drop
struct InFlightPermit(Arc<AtomicUsize>);

impl InFlightPermit {
    fn try_acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(counter.clone()))
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reply handle carried through the buffer and ordering stages
struct InFlight {
    lifecycle: ReadingLifecycle,
    reply: oneshot::Sender<IngestOutcome>,
    _permit: InFlightPermit,
}

impl InFlight {
    fn advance(&mut self, next: ReadingState) {
        if let Err(e) = self.lifecycle.advance(next) {
            log::error!("❌ {}: {}", self.lifecycle.id(), e);
        }
    }
}

/// Per-device consecutive dead-letter tracking
#[derive(Debug, Default)]
struct Throttle {
    consecutive_failures: u32,
    until: Option<Instant>,
}

impl Throttle {
    fn is_active(&mut self, now: Instant) -> bool {
        match self.until {
            Some(until) if now < until => true,
            Some(_) => {
                self.until = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }
}

struct DeviceWorker {
    ordering: OrderingEngine<InFlight>,
    windows: WindowManager,
}

struct DeviceSession {
    device_id: String,
    buffer: Mutex<IngestionBuffer<InFlight>>,
    /// Held for the whole flush; `None` until recovered from the store
    worker: tokio::sync::Mutex<Option<DeviceWorker>>,
    throttle: Mutex<Throttle>,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    persisted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    late: AtomicU64,
    dead_lettered: AtomicU64,
    backpressure: AtomicU64,
    gaps: AtomicU64,
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub persisted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Subset of `rejected`: too old or behind a released gap
    pub late: u64,
    pub dead_lettered: u64,
    pub backpressure: u64,
    pub gaps: u64,
    pub in_flight: usize,
    pub devices: usize,
    /// Dead letters that could not be stored and are held in memory
    pub orphaned_dead_letters: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub orphans_stored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub held_rejected: usize,
    pub snapshots_written: usize,
    pub snapshots_failed: usize,
}

pub struct PipelineCoordinator {
    config: PipelineConfig,
    policies: Arc<MetricPolicies>,
    retry_policy: RetryPolicy,
    keys: Arc<DeviceKeyCache>,
    gateway: Arc<dyn PersistenceGateway>,
    queries: Arc<dyn QueryStore>,
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    in_flight: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    counters: Counters,
    fatal: Mutex<Option<String>>,
    fatal_notify: Notify,
    orphans: Mutex<Vec<DeadLetter>>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl PipelineCoordinator {
    pub fn new(
        config: PipelineConfig,
        keys: Arc<DeviceKeyCache>,
        gateway: Arc<dyn PersistenceGateway>,
        queries: Arc<dyn QueryStore>,
    ) -> Result<Arc<Self>, PipelineError> {
        Self::new_with_timestamp_fn(
            config,
            keys,
            gateway,
            queries,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    /// Coordinator with a custom clock (unix seconds), used by tests
    pub fn new_with_timestamp_fn(
        config: PipelineConfig,
        keys: Arc<DeviceKeyCache>,
        gateway: Arc<dyn PersistenceGateway>,
        queries: Arc<dyn QueryStore>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Arc<Self>, PipelineError> {
        config.validate()?;

        Ok(Arc::new(Self {
            policies: Arc::new(config.metric_policies.clone()),
            retry_policy: config.retry_policy(),
            config,
            keys,
            gateway,
            queries,
            sessions: RwLock::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
            fatal: Mutex::new(None),
            fatal_notify: Notify::new(),
            orphans: Mutex::new(Vec::new()),
            now_fn,
        }))
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Run one reading through the pipeline and wait for its outcome
    pub async fn ingest(self: &Arc<Self>, request: IngestRequest) -> IngestOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let now = self.now();
        let mut lifecycle = ReadingLifecycle::new(ReadingId {
            device_id: request.device_id.clone(),
            sequence: request.sequence,
        });

        let device = match self.keys.resolve(&request.device_id).await {
            Ok(device) => device,
            Err(e) => {
                log::warn!("⚠️  Device store unavailable for {}: {}", request.device_id, e);
                return self.reject_early(&mut lifecycle, RejectReason::DeviceStoreUnavailable);
            }
        };

        if let Err(e) = auth::verify(device.as_ref(), &request, now) {
            log::debug!("🔒 Rejected {}: {}", lifecycle.id(), e);
            return self.reject_early(&mut lifecycle, RejectReason::from(&e));
        }
        self.advance_early(&mut lifecycle, ReadingState::Verified);

        if self.is_shutting_down() {
            return self.reject_early(&mut lifecycle, RejectReason::ShuttingDown);
        }

        if let Err(reason) = self.validate(&request, now) {
            log::debug!("🚫 Invalid reading {}: {}", lifecycle.id(), reason);
            return self.reject_early(&mut lifecycle, RejectReason::InvalidReading(reason));
        }

        let session = self.session(&request.device_id);
        if lock(&session.throttle).is_active(Instant::now()) {
            log::debug!("🐢 {} throttled after repeated dead letters", request.device_id);
            self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Backpressure;
        }

        let Some(permit) = InFlightPermit::try_acquire(&self.in_flight, self.config.max_in_flight)
        else {
            log::warn!("⚠️  In-flight limit reached ({})", self.config.max_in_flight);
            self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Backpressure;
        };

        let reading = Reading {
            is_alert: self.policies.is_alert(&request.metric, request.value),
            device_id: request.device_id,
            metric: request.metric,
            value: request.value,
            timestamp: request.timestamp,
            sequence: request.sequence,
            received_at: now,
        };

        self.advance_early(&mut lifecycle, ReadingState::Buffered);
        let (reply, outcome_rx) = oneshot::channel();
        let ticket = InFlight {
            lifecycle,
            reply,
            _permit: permit,
        };

        let enqueued = {
            let mut buffer = lock(&session.buffer);
            // Checked under the buffer lock so shutdown's drain cannot miss this entry
            if self.is_shutting_down() {
                drop(buffer);
                let mut ticket = ticket;
                ticket.advance(ReadingState::Rejected);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Rejected(RejectReason::ShuttingDown);
            }
            buffer.enqueue(reading, ticket, now)
        };

        match enqueued {
            Ok(Enqueued::FlushDue) => self.spawn_flush(session),
            Ok(Enqueued::Queued) => {}
            Err(EnqueueRejection::Full) => {
                log::debug!("🪣 Buffer full for {}", session.device_id);
                self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Backpressure;
            }
            Err(EnqueueRejection::TooOld) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.counters.late.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Rejected(RejectReason::TooOld);
            }
        }

        match timeout(self.config.ingest_timeout(), outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a reply: the pipeline is going away
            Ok(Err(_)) => IngestOutcome::Rejected(RejectReason::ShuttingDown),
            Err(_) => IngestOutcome::Rejected(RejectReason::Timeout),
        }
    }

    fn advance_early(&self, lifecycle: &mut ReadingLifecycle, next: ReadingState) {
        if let Err(e) = lifecycle.advance(next) {
            log::error!("❌ {}: {}", lifecycle.id(), e);
        }
    }

    fn reject_early(&self, lifecycle: &mut ReadingLifecycle, reason: RejectReason) -> IngestOutcome {
        self.advance_early(lifecycle, ReadingState::Rejected);
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        IngestOutcome::Rejected(reason)
    }

    fn validate(&self, request: &IngestRequest, now: i64) -> Result<(), String> {
        if request.metric.trim().is_empty() {
            return Err("metric name is empty".to_string());
        }
        if request.sequence > i64::MAX as u64 {
            return Err(format!("sequence {} out of range", request.sequence));
        }
        // Too-old readings are rejected as late at the buffer
        let skew = request.timestamp.saturating_sub(now);
        if skew > self.config.max_clock_skew_secs {
            return Err(format!(
                "timestamp {} is {}s ahead of the edge clock (max {}s)",
                request.timestamp, skew, self.config.max_clock_skew_secs
            ));
        }
        self.policies.validate(&request.metric, request.value)
    }

    fn session(&self, device_id: &str) -> Arc<DeviceSession> {
        {
            let sessions = match self.sessions.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(session) = sessions.get(device_id) {
                return session.clone();
            }
        }

        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .entry(device_id.to_string())
            .or_insert_with(|| {
                log::debug!("📟 New device session: {}", device_id);
                Arc::new(DeviceSession {
                    device_id: device_id.to_string(),
                    buffer: Mutex::new(IngestionBuffer::new(
                        self.config.buffer_max_entries,
                        self.config.buffer_flush_threshold,
                        self.config.lateness_secs,
                    )),
                    worker: tokio::sync::Mutex::new(None),
                    throttle: Mutex::new(Throttle::default()),
                })
            })
            .clone()
    }

    fn all_sessions(&self) -> Vec<Arc<DeviceSession>> {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    fn spawn_flush(self: &Arc<Self>, session: Arc<DeviceSession>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.flush_device(&session).await;
        });
    }

    /// Schedule a flush for every device whose worker is idle
    pub fn spawn_flushes(self: &Arc<Self>) -> usize {
        let mut spawned = 0;
        for session in self.all_sessions() {
            if session.worker.try_lock().is_err() {
                continue;
            }
            self.spawn_flush(session);
            spawned += 1;
        }
        spawned
    }

    /// Flush every device and wait for all of them
    pub async fn flush_all(self: &Arc<Self>) {
        let mut set = JoinSet::new();
        for session in self.all_sessions() {
            let this = self.clone();
            set.spawn(async move { this.flush_device(&session).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                log::error!("❌ Flush task failed: {}", e);
            }
        }
    }

    async fn recover_worker(&self, device_id: &str, now: i64) -> Result<DeviceWorker, PipelineError> {
        let last_sequence = {
            let queries = self.queries.clone();
            let device = device_id.to_string();
            with_retry(&self.retry_policy, device_id, move || {
                let queries = queries.clone();
                let device = device.clone();
                async move { queries.last_sequence(&device).await }
            })
            .await?
        };

        let retention = self.config.window_grace_secs.max(self.config.lateness_secs);
        let min_window_start = now - self.config.window_size_secs - retention;
        let snapshots = {
            let queries = self.queries.clone();
            let device = device_id.to_string();
            with_retry(&self.retry_policy, device_id, move || {
                let queries = queries.clone();
                let device = device.clone();
                async move { queries.recent_snapshots(&device, min_window_start).await }
            })
            .await?
        };

        let mut windows = WindowManager::new(
            device_id,
            self.config.window_size_secs,
            self.config.window_grace_secs,
            self.config.lateness_secs,
            self.policies.clone(),
        );
        let restored = snapshots.len();
        for snapshot in snapshots {
            windows.restore(snapshot);
        }

        if last_sequence.is_some() || restored > 0 {
            log::info!(
                "♻️  Recovered {}: last sequence {:?}, {} open windows",
                device_id,
                last_sequence,
                restored
            );
        }

        Ok(DeviceWorker {
            ordering: OrderingEngine::new(
                device_id,
                last_sequence,
                self.config.max_sequence_gap,
                self.config.lateness_secs,
            ),
            windows,
        })
    }

    async fn flush_device(&self, session: &DeviceSession) {
        let mut guard = session.worker.lock().await;
        let now = self.now();

        if guard.is_none() {
            match self.recover_worker(&session.device_id, now).await {
                Ok(worker) => *guard = Some(worker),
                Err(e) => {
                    log::warn!("⚠️  Cannot recover state for {}: {}", session.device_id, e);
                    if e.is_fatal() {
                        self.raise_fatal(e.to_string());
                    }
                    return;
                }
            }
        }
        let Some(worker) = guard.as_mut() else {
            return;
        };

        let drained = lock(&session.buffer).drain(now);
        for mut late in drained.late {
            late.ticket.advance(ReadingState::Rejected);
            self.reply(late.ticket, IngestOutcome::Rejected(RejectReason::TooOld));
        }

        let output = worker.ordering.process(drained.ready, now);
        if !output.is_empty() {
            self.settle(session, worker, output, now).await;
        }

        for snapshot in worker.windows.due_for_close(now) {
            log::debug!("🔒 Closing window {}", snapshot.key.storage_key());
            if let Err(reason) = self.persist_snapshot(&snapshot, now).await {
                log::warn!("⚠️  Final snapshot {} dead-lettered: {}", snapshot.key.storage_key(), reason.0);
            }
        }
        let evicted = worker.windows.evict_expired(now);
        if evicted > 0 {
            log::debug!("🧹 Evicted {} windows for {}", evicted, session.device_id);
        }
    }

    /// Apply an ordering result: aggregate, persist and answer each reading
    async fn settle(
        &self,
        session: &DeviceSession,
        worker: &mut DeviceWorker,
        output: OrderingOutput<InFlight>,
        now: i64,
    ) {
        for mut dup in output.duplicates {
            dup.ticket.advance(ReadingState::Ordered);
            dup.ticket.advance(ReadingState::Persisted);
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.reply(
                dup.ticket,
                IngestOutcome::Persisted {
                    note: Some(IngestNote::Duplicate),
                },
            );
        }

        for mut late in output.late {
            late.ticket.advance(ReadingState::Rejected);
            self.reply(late.ticket, IngestOutcome::Rejected(RejectReason::Late));
        }

        for gap in &output.gaps {
            self.persist_gap(gap).await;
        }

        // Readings whose raw row is stored, grouped by the window they touched
        let mut touched: BTreeMap<WindowKey, Vec<(BufferEntry<InFlight>, Option<IngestNote>)>> =
            BTreeMap::new();

        for released in output.accepted {
            let mut entry = released.entry;
            let note = released.gap.map(|g| IngestNote::GapDetected {
                expected: g.expected,
                received: g.received,
            });

            if !worker.windows.accepts(&entry.reading, now) {
                entry.ticket.advance(ReadingState::Rejected);
                self.reply(entry.ticket, IngestOutcome::Rejected(RejectReason::Late));
                continue;
            }

            entry.ticket.advance(ReadingState::Ordered);
            let update = worker.windows.apply(&entry.reading, now);
            entry.ticket.advance(ReadingState::Aggregated);

            match self.persist_reading(&entry.reading).await {
                Ok(_) => touched.entry(update.key).or_default().push((entry, note)),
                Err(e) => {
                    let (reason, retry_count) = self.describe_failure(&e);
                    match DeadLetter::for_reading(&entry.reading, &reason, retry_count, now) {
                        Ok(letter) => self.store_dead_letter(letter).await,
                        Err(se) => log::error!("❌ Cannot encode dead letter for {}: {}", entry.reading.identity(), se),
                    }
                    self.record_dead_letter(session);
                    entry.ticket.advance(ReadingState::DeadLettered);
                    self.reply(entry.ticket, IngestOutcome::DeadLettered { reason, retry_count });
                }
            }
        }

        for (key, entries) in touched {
            let Some(snapshot) = worker.windows.snapshot(&key) else {
                continue;
            };

            match self.persist_snapshot(&snapshot, now).await {
                Ok(()) => {
                    lock(&session.throttle).consecutive_failures = 0;
                    for (mut entry, note) in entries {
                        entry.ticket.advance(ReadingState::Persisted);
                        self.reply(entry.ticket, IngestOutcome::Persisted { note });
                    }
                }
                Err((reason, retry_count)) => {
                    for (mut entry, _) in entries {
                        self.record_dead_letter(session);
                        entry.ticket.advance(ReadingState::DeadLettered);
                        self.reply(
                            entry.ticket,
                            IngestOutcome::DeadLettered {
                                reason: reason.clone(),
                                retry_count,
                            },
                        );
                    }
                }
            }
        }
    }

    fn reply(&self, ticket: InFlight, outcome: IngestOutcome) {
        let counter = match &outcome {
            IngestOutcome::Persisted {
                note: Some(IngestNote::Duplicate),
            } => None,
            IngestOutcome::Persisted { .. } => Some(&self.counters.persisted),
            IngestOutcome::Rejected(_) => Some(&self.counters.rejected),
            IngestOutcome::DeadLettered { .. } => Some(&self.counters.dead_lettered),
            IngestOutcome::Backpressure => Some(&self.counters.backpressure),
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(
            outcome,
            IngestOutcome::Rejected(RejectReason::Late | RejectReason::TooOld)
        ) {
            self.counters.late.fetch_add(1, Ordering::Relaxed);
        }

        // Caller may have timed out already
        let _ = ticket.reply.send(outcome);
    }

    fn record_dead_letter(&self, session: &DeviceSession) {
        let mut throttle = lock(&session.throttle);
        throttle.consecutive_failures += 1;
        if throttle.consecutive_failures >= self.config.backpressure_failure_threshold
            && throttle.until.is_none()
        {
            throttle.until = Some(Instant::now() + self.config.backpressure_cooldown());
            log::warn!(
                "🐢 Throttling {} for {}ms after {} consecutive dead letters",
                session.device_id,
                self.config.backpressure_cooldown_ms,
                throttle.consecutive_failures
            );
        }
    }

    /// Reason text and retries consumed, raising the fatal signal on corruption
    fn describe_failure(&self, err: &PipelineError) -> (String, u32) {
        if err.is_fatal() {
            self.raise_fatal(err.to_string());
        }
        match err {
            PipelineError::PersistenceExhausted {
                attempts, reason, ..
            } => (reason.clone(), *attempts),
            other => (other.to_string(), 0),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn persist_reading(&self, reading: &Reading) -> Result<bool, PipelineError> {
        let gateway = self.gateway.clone();
        let reading = reading.clone();
        let entity = reading.identity().to_string();
        with_retry(&self.retry_policy, &entity, move || {
            let gateway = gateway.clone();
            let reading = reading.clone();
            async move { gateway.write_reading(&reading).await }
        })
        .await
    }

    /// Write a snapshot; on failure it is dead-lettered and the reason returned
    async fn persist_snapshot(
        &self,
        snapshot: &AggregateSnapshot,
        now: i64,
    ) -> Result<(), (String, u32)> {
        let gateway = self.gateway.clone();
        let owned = snapshot.clone();
        let entity = snapshot.key.storage_key();

        let result = with_retry(&self.retry_policy, &entity, move || {
            let gateway = gateway.clone();
            let snapshot = owned.clone();
            async move { gateway.write_snapshot(&snapshot).await }
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let (reason, retry_count) = self.describe_failure(&e);
                match DeadLetter::for_snapshot(snapshot, &reason, retry_count, now) {
                    Ok(letter) => self.store_dead_letter(letter).await,
                    Err(se) => log::error!("❌ Cannot encode dead letter for {}: {}", entity, se),
                }
                Err((reason, retry_count))
            }
        }
    }

    async fn persist_gap(&self, gap: &GapSignal) {
        self.counters.gaps.fetch_add(1, Ordering::Relaxed);
        let gateway = self.gateway.clone();
        let owned = gap.clone();
        let entity = format!("gap {}:{}-{}", gap.device_id, gap.expected, gap.received);

        let result = with_retry(&self.retry_policy, &entity, move || {
            let gateway = gateway.clone();
            let gap = owned.clone();
            async move { gateway.write_gap_signal(&gap).await }
        })
        .await;

        if let Err(e) = result {
            if e.is_fatal() {
                self.raise_fatal(e.to_string());
            }
            log::error!("❌ Failed to persist {}: {}", entity, e);
        }
    }

    /// Durably record a dead letter, or keep it in memory until the store recovers
    async fn store_dead_letter(&self, letter: DeadLetter) {
        log::warn!(
            "💀 Dead letter {} {} after {} retries: {}",
            letter.kind.as_str(),
            letter.entity_key,
            letter.retry_count,
            letter.reason
        );

        let gateway = self.gateway.clone();
        let owned = letter.clone();
        let result = with_retry(&self.retry_policy, &letter.entity_key, move || {
            let gateway = gateway.clone();
            let letter = owned.clone();
            async move { gateway.write_dead_letter(&letter).await }
        })
        .await;

        if let Err(e) = result {
            if e.is_fatal() {
                self.raise_fatal(e.to_string());
            }
            log::error!(
                "❌ Dead letter {} kept in memory, store unavailable: {}",
                letter.entity_key,
                e
            );
            lock(&self.orphans).push(letter);
        }
    }

    async fn flush_orphans(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.orphans));
        if pending.is_empty() {
            return 0;
        }

        let mut stored = 0;
        for letter in pending {
            match self.gateway.write_dead_letter(&letter).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    log::warn!("⚠️  Orphaned dead letter {} still unstored: {}", letter.entity_key, e);
                    lock(&self.orphans).push(letter);
                }
            }
        }
        stored
    }

    // ------------------------------------------------------------------
    // Dead-letter replay
    // ------------------------------------------------------------------

    /// Retry up to `limit` dead letters; successes are removed from the table
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplayReport, PipelineError> {
        let mut report = ReplayReport {
            orphans_stored: self.flush_orphans().await,
            ..Default::default()
        };

        let entries = self.queries.list_dead_letters(limit).await?;
        let now = self.now();

        for mut entry in entries {
            let result = match entry.kind {
                DeadLetterKind::Reading => match serde_json::from_str::<Reading>(&entry.payload) {
                    Ok(reading) => self.persist_reading(&reading).await.map(|_| ()),
                    Err(e) => Err(PipelineError::TransientStorage(format!("bad payload: {}", e))),
                },
                DeadLetterKind::Snapshot => {
                    match serde_json::from_str::<AggregateSnapshot>(&entry.payload) {
                        Ok(snapshot) => {
                            let gateway = self.gateway.clone();
                            with_retry(&self.retry_policy, &entry.entity_key, move || {
                                let gateway = gateway.clone();
                                let snapshot = snapshot.clone();
                                async move { gateway.write_snapshot(&snapshot).await }
                            })
                            .await
                            .map(|_| ())
                        }
                        Err(e) => Err(PipelineError::TransientStorage(format!("bad payload: {}", e))),
                    }
                }
            };

            match result {
                Ok(()) => {
                    self.gateway
                        .delete_dead_letter(entry.kind, &entry.entity_key)
                        .await?;
                    log::info!("✅ Replayed dead letter {}", entry.entity_key);
                    report.replayed += 1;
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.raise_fatal(e.to_string());
                        return Err(e);
                    }
                    let (reason, attempts) = self.describe_failure(&e);
                    entry.retry_count = entry.retry_count.saturating_add(attempts + 1);
                    entry.reason = reason;
                    entry.updated_at = now;
                    self.gateway.write_dead_letter(&entry).await?;
                    report.failed += 1;
                }
            }
        }

        if report.replayed > 0 || report.failed > 0 {
            log::info!(
                "🔁 Dead-letter replay: {} replayed, {} still failing",
                report.replayed,
                report.failed
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting readings, drain what was accepted and close all windows
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return report;
        }
        log::info!("🛑 Pipeline shutting down, draining buffers");

        self.flush_all().await;

        let now = self.now();
        for session in self.all_sessions() {
            let mut guard = session.worker.lock().await;

            let drained = lock(&session.buffer).drain(now);
            let mut leftovers: Vec<_> = drained.ready.into_iter().chain(drained.late).collect();

            if let Some(worker) = guard.as_mut() {
                leftovers.extend(worker.ordering.drain_held());

                for snapshot in worker.windows.close_all(now) {
                    match self.persist_snapshot(&snapshot, now).await {
                        Ok(()) => report.snapshots_written += 1,
                        Err(_) => report.snapshots_failed += 1,
                    }
                }
            }

            for mut entry in leftovers {
                entry.ticket.advance(ReadingState::Rejected);
                self.reply(entry.ticket, IngestOutcome::Rejected(RejectReason::ShuttingDown));
                report.held_rejected += 1;
            }
        }

        let orphans = self.flush_orphans().await;
        if orphans > 0 {
            log::info!("💾 Stored {} orphaned dead letters on shutdown", orphans);
        }

        log::info!(
            "✅ Pipeline drained: {} snapshots written, {} failed, {} held readings rejected",
            report.snapshots_written,
            report.snapshots_failed,
            report.held_rejected
        );
        report
    }

    // ------------------------------------------------------------------
    // Fatal signal
    // ------------------------------------------------------------------

    fn raise_fatal(&self, message: String) {
        let mut slot = lock(&self.fatal);
        if slot.is_none() {
            log::error!("💥 Fatal pipeline error: {}", message);
            *slot = Some(message);
            self.fatal_notify.notify_waiters();
        }
    }

    /// Resolves once a fatal storage error has been observed
    pub async fn fatal_error(&self) -> String {
        loop {
            let notified = self.fatal_notify.notified();
            if let Some(message) = lock(&self.fatal).clone() {
                return message;
            }
            notified.await;
        }
    }

    pub fn is_healthy(&self) -> bool {
        lock(&self.fatal).is_none()
    }

    // ------------------------------------------------------------------
    // Queries and provisioning
    // ------------------------------------------------------------------

    pub fn apply_provisioning_event(&self, event: ProvisioningEvent) {
        self.keys.apply_event(event);
    }

    pub async fn get_aggregate(
        &self,
        device_id: &str,
        metric: &str,
        window_start: i64,
    ) -> Result<Option<AggregateSnapshot>, PipelineError> {
        Ok(self
            .queries
            .get_aggregate(device_id, metric, window_start)
            .await?)
    }

    pub async fn get_raw_readings(
        &self,
        device_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Reading>, PipelineError> {
        Ok(self.queries.get_raw_readings(device_id, from, to).await?)
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, PipelineError> {
        Ok(self.queries.list_dead_letters(limit).await?)
    }

    pub async fn list_gap_signals(
        &self,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GapSignal>, PipelineError> {
        Ok(self.queries.list_gap_signals(device_id, limit).await?)
    }

    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Reading>, PipelineError> {
        Ok(self.queries.recent_alerts(limit).await?)
    }

    /// Readings currently buffered across all devices
    pub fn buffered_len(&self) -> usize {
        self.all_sessions()
            .iter()
            .map(|s| lock(&s.buffer).len())
            .sum()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            late: self.counters.late.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            backpressure: self.counters.backpressure.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            devices: self.all_sessions().len(),
            orphaned_dead_letters: lock(&self.orphans).len(),
        }
    }
}
