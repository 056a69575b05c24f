/*!
 * Disk-pressure archiver
 *
 * A timer thread periodically checks how full the audit store is. Crossing
 * the shutdown threshold suspends message processing until usage drops back
 * below it; crossing the start threshold triggers an archive run that moves
 * the oldest records to an [`ArchiveSink`] and deletes them once the sink has
 * flushed, until usage falls below the stop threshold.
 *
 * Runs are single-flight across the cluster through a [`DistributedLock`]
 * taken with a non-blocking try: a node that finds the lock held skips the
 * tick. The timer never runs an archive pass itself; it hands the run to a
 * worker thread and skips ticks while that worker is busy.
 *
 * ```text
 *   tick ──▶ CheckingUsage ──▶ (usage ≥ start) ──▶ Archiving ──▶ Idle
 *                 │
 *                 └── max size unknown ──▶ Halted (timer stops)
 * ```
 */

pub mod lock;
pub mod sink;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vigil_core_audit::{messages, AuditDetail, AuditLevel, DetailMessage, RecordId};

use crate::config::ArchiverConfig;
use crate::error::{Result, VigilError};
use crate::factory::{self, AuditContextFactory};
use crate::store::RecordStore;

pub use lock::{
    ClusterPropertyStore, DistributedLock, LockGuard, MemoryPropertyStore, PropertyLease,
    ARCHIVER_LOCK_PROPERTY,
};
pub use sink::{ArchiveSink, ArchiveTransport, DirectoryTransport, TransportArchiveSink};

/// Upper bound on identifiers handed to the sink in one batch
pub const MAX_BATCH_SIZE: u64 = 100_000;

/// Component name on the archiver's system records
pub const ARCHIVER_COMPONENT: &str = "audit-archiver";

/// Ordered usage thresholds plus batching and lock settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiverThresholds {
    pub stop: u8,
    pub start: u8,
    pub shutdown: u8,
    pub batch_size: u64,
    pub lock_timeout: Duration,
}

impl ArchiverThresholds {
    /// Validated threshold set; requires `stop <= start <= shutdown <= 100`
    pub fn new(
        stop: u8,
        start: u8,
        shutdown: u8,
        batch_size: u64,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let thresholds = Self {
            stop,
            start,
            shutdown,
            batch_size,
            lock_timeout,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.stop <= self.start && self.start <= self.shutdown && self.shutdown <= 100) {
            return Err(VigilError::Config(format!(
                "archiver thresholds must satisfy stop <= start <= shutdown <= 100 (got {}/{}/{})",
                self.stop, self.start, self.shutdown
            )));
        }
        if self.batch_size == 0 {
            return Err(VigilError::Config(
                "archiver batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Identifiers per batch after applying [`MAX_BATCH_SIZE`]
    pub fn effective_batch(&self) -> u64 {
        self.batch_size.min(MAX_BATCH_SIZE)
    }
}

impl Default for ArchiverThresholds {
    fn default() -> Self {
        Self {
            stop: 50,
            start: 75,
            shutdown: 90,
            batch_size: 10_000,
            lock_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverState {
    Idle,
    CheckingUsage,
    Archiving,
    Halted,
}

/// Notifications published by the archiver
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiverEvent {
    Suspended { usage: f64 },
    Resumed { usage: f64 },
    Archived {
        first: RecordId,
        last: RecordId,
        deleted: u64,
    },
    Halted { reason: String },
    LockSkipped,
}

/// Suspend/resume surface of the message-processing pipeline
pub trait TrafficControl: Send + Sync {
    fn suspend(&self);
    fn resume(&self);
}

/// Traffic control that only remembers what it was told
#[derive(Debug, Default)]
pub struct FlagTrafficControl {
    suspended: AtomicBool,
    transitions: Mutex<Vec<bool>>,
}

impl FlagTrafficControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Every call received, `true` for suspend
    pub fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().clone()
    }
}

impl TrafficControl for FlagTrafficControl {
    fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        self.transitions.lock().push(true);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        self.transitions.lock().push(false);
    }
}

/// Store usage at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageReport {
    pub current_bytes: u64,
    pub max_bytes: u64,
    /// Bytes expected to be freed by pending deletions
    pub projected_reclaim: u64,
    pub percent: f64,
}

impl UsageReport {
    fn new(current_bytes: u64, max_bytes: u64, projected_reclaim: u64) -> Self {
        let used = current_bytes.saturating_sub(projected_reclaim);
        Self {
            current_bytes,
            max_bytes,
            projected_reclaim,
            percent: used as f64 * 100.0 / max_bytes as f64,
        }
    }
}

/// Result of one usage check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UsageCheck {
    /// Maximum size unknown; the archiver is now halted
    Halted,
    BelowStart(f64),
    ArchiveEligible(f64),
}

/// What one timer-driven run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub usage: Option<f64>,
    pub passes: u32,
    pub records_archived: u64,
    pub records_deleted: u64,
    pub lock_skipped: bool,
    pub halted: bool,
}

pub struct Archiver {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn ArchiveSink>,
    lock: Arc<dyn DistributedLock>,
    traffic: Arc<dyn TrafficControl>,
    thresholds: ArcSwap<ArchiverThresholds>,
    factory: &'static AuditContextFactory,
    max_size_override: Option<u64>,
    settle_delay: Duration,
    events: Option<Sender<ArchiverEvent>>,
    state: Mutex<ArchiverState>,
    suspended: AtomicBool,
    running: AtomicBool,
    high_water: AtomicI64,
}

impl Archiver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn ArchiveSink>,
        lock: Arc<dyn DistributedLock>,
        traffic: Arc<dyn TrafficControl>,
    ) -> Self {
        Self {
            store,
            sink,
            lock,
            traffic,
            thresholds: ArcSwap::from_pointee(ArchiverThresholds::default()),
            factory: factory::global(),
            max_size_override: None,
            settle_delay: Duration::from_secs(2),
            events: None,
            state: Mutex::new(ArchiverState::Idle),
            suspended: AtomicBool::new(false),
            running: AtomicBool::new(false),
            high_water: AtomicI64::new(0),
        }
    }

    /// Apply thresholds, settle delay and size override from configuration
    pub fn from_config(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn ArchiveSink>,
        lock: Arc<dyn DistributedLock>,
        traffic: Arc<dyn TrafficControl>,
        config: &ArchiverConfig,
    ) -> Result<Self> {
        let mut archiver = Self::new(store, sink, lock, traffic)
            .with_thresholds(config.thresholds()?)
            .with_settle_delay(config.settle_delay());
        archiver.max_size_override = config.max_store_bytes;
        Ok(archiver)
    }

    pub fn with_thresholds(self, thresholds: ArchiverThresholds) -> Self {
        self.thresholds.store(Arc::new(thresholds));
        self
    }

    /// Factory used for the archiver's own system records
    pub fn with_factory(mut self, factory: &'static AuditContextFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Use `max_bytes` instead of the store's reported maximum
    pub fn with_max_size(mut self, max_bytes: u64) -> Self {
        self.max_size_override = Some(max_bytes);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_events(mut self, events: Sender<ArchiverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn thresholds(&self) -> Arc<ArchiverThresholds> {
        self.thresholds.load_full()
    }

    /// Replace the thresholds; an invalid set is rejected and the current one kept
    pub fn update_thresholds(&self, thresholds: ArchiverThresholds) -> Result<()> {
        if let Err(e) = thresholds.validate() {
            warn!("Rejected archiver threshold update: {}", e);
            return Err(e);
        }
        info!(
            "Archiver thresholds now stop {}% / start {}% / shutdown {}%",
            thresholds.stop, thresholds.start, thresholds.shutdown
        );
        self.thresholds.store(Arc::new(thresholds));
        Ok(())
    }

    /// Hot reload from a changed configuration
    pub fn reload(&self, config: &ArchiverConfig) -> Result<()> {
        match config.thresholds() {
            Ok(thresholds) => self.update_thresholds(thresholds),
            Err(e) => {
                warn!("Rejected archiver threshold update: {}", e);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> ArchiverState {
        *self.state.lock()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Highest identifier archived and deleted so far
    pub fn high_water_mark(&self) -> RecordId {
        self.high_water.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ArchiverState) {
        let mut current = self.state.lock();
        // Halted is terminal
        if *current != ArchiverState::Halted {
            *current = state;
        }
    }

    fn emit(&self, event: ArchiverEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }

    fn audit(&self, level: AuditLevel, action: &str, message: &DetailMessage, params: Vec<String>) {
        let text = message.format(&params);
        let detail = AuditDetail::new(message, params);
        if let Err(e) = self
            .factory
            .system_event(level, ARCHIVER_COMPONENT, action, &text, Some(detail))
        {
            error!("Failed to audit archiver event '{}': {}", action, e);
        }
    }

    /// Usage after discounting `projected_reclaim` bytes; `None` when the maximum is unknown
    pub fn usage(&self, projected_reclaim: u64) -> Result<Option<UsageReport>> {
        let max = match self.max_size_override {
            Some(max) => Some(max),
            None => self.store.max_size()?,
        };
        let Some(max) = max.filter(|m| *m > 0) else {
            return Ok(None);
        };
        let current = self.store.current_size()?;
        Ok(Some(UsageReport::new(current, max, projected_reclaim)))
    }

    fn halt(&self, reason: &str) {
        error!("Audit archiver halted: {}", reason);
        *self.state.lock() = ArchiverState::Halted;
        self.emit(ArchiverEvent::Halted {
            reason: reason.to_string(),
        });
        self.audit(
            AuditLevel::Severe,
            "halt",
            &messages::ARCHIVER_HALTED,
            vec![reason.to_string()],
        );
    }

    /// Suspend or resume message processing for `usage`; acts on transitions only
    fn apply_traffic(&self, usage: f64, shutdown: u8) {
        let shutdown_f = f64::from(shutdown);
        if usage >= shutdown_f {
            if !self.suspended.swap(true, Ordering::SeqCst) {
                warn!(
                    "Audit store usage {:.1}% reached shutdown threshold {}%; suspending message processing",
                    usage, shutdown
                );
                self.traffic.suspend();
                self.emit(ArchiverEvent::Suspended { usage });
                self.audit(
                    AuditLevel::Severe,
                    "suspend",
                    &messages::ARCHIVER_SUSPENDED,
                    vec![format!("{:.1}", usage), shutdown.to_string()],
                );
            }
        } else if self.suspended.swap(false, Ordering::SeqCst) {
            info!(
                "Audit store usage {:.1}% below shutdown threshold {}%; resuming message processing",
                usage, shutdown
            );
            self.traffic.resume();
            self.emit(ArchiverEvent::Resumed { usage });
            self.audit(
                AuditLevel::Info,
                "resume",
                &messages::ARCHIVER_RESUMED,
                vec![format!("{:.1}", usage), shutdown.to_string()],
            );
        }
    }

    /// Measure usage, apply suspend/resume and report whether archiving is due
    pub fn check_usage(&self) -> Result<UsageCheck> {
        if self.state() == ArchiverState::Halted {
            return Ok(UsageCheck::Halted);
        }
        self.set_state(ArchiverState::CheckingUsage);
        let result = self.check_usage_inner();
        self.set_state(ArchiverState::Idle);
        result
    }

    fn check_usage_inner(&self) -> Result<UsageCheck> {
        let thresholds = self.thresholds.load();
        let Some(report) = self.usage(0)? else {
            self.halt("maximum audit store size is unknown");
            return Ok(UsageCheck::Halted);
        };
        debug!(
            "Audit store usage {:.1}% ({} of {} bytes)",
            report.percent, report.current_bytes, report.max_bytes
        );

        self.apply_traffic(report.percent, thresholds.shutdown);
        if report.percent >= f64::from(thresholds.start) {
            Ok(UsageCheck::ArchiveEligible(report.percent))
        } else {
            Ok(UsageCheck::BelowStart(report.percent))
        }
    }

    /// One timer tick: check usage and archive when eligible
    pub fn run_once(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        match self.check_usage()? {
            UsageCheck::Halted => {
                summary.halted = true;
                return Ok(summary);
            }
            UsageCheck::BelowStart(usage) => {
                summary.usage = Some(usage);
                return Ok(summary);
            }
            UsageCheck::ArchiveEligible(usage) => summary.usage = Some(usage),
        }

        if !self.sink.is_enabled() {
            warn!("Audit store needs archiving but no archive sink is enabled");
            return Ok(summary);
        }

        let thresholds = self.thresholds.load_full();
        let Some(guard) = LockGuard::try_acquire(self.lock.as_ref(), thresholds.lock_timeout)?
        else {
            info!("Another node holds the archiver lock; skipping this run");
            self.emit(ArchiverEvent::LockSkipped);
            summary.lock_skipped = true;
            return Ok(summary);
        };

        self.set_state(ArchiverState::Archiving);
        let result = self.archive(&thresholds, &guard, &mut summary);
        self.set_state(ArchiverState::Idle);
        drop(guard);
        result?;

        if let Some(report) = self.usage(0)? {
            self.apply_traffic(report.percent, thresholds.shutdown);
            summary.usage = Some(report.percent);
        }
        summary.halted = self.state() == ArchiverState::Halted;
        Ok(summary)
    }

    fn archive(
        &self,
        thresholds: &ArchiverThresholds,
        guard: &LockGuard<'_>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let stop = f64::from(thresholds.stop);
        let batch = thresholds.effective_batch() as RecordId;

        loop {
            let Some(report) = self.usage(0)? else {
                self.halt("maximum audit store size is unknown");
                return Ok(());
            };
            self.apply_traffic(report.percent, thresholds.shutdown);
            if report.percent < stop {
                return Ok(());
            }

            let committed = self.high_water.load(Ordering::SeqCst);
            let mut high_water = committed;
            let mut first: Option<RecordId> = None;
            let mut pass_bytes = 0u64;
            let mut pass_records = 0u64;
            let mut lease_lost = false;

            loop {
                match self.usage(pass_bytes)? {
                    Some(report) if report.percent >= stop => {}
                    _ => break,
                }
                let Some(low) = self.store.min_id_above(high_water)? else {
                    break;
                };
                let end = low.saturating_add(batch - 1);

                match self.sink.archive_records(low, end) {
                    Ok(Some(info)) => {
                        let Some(highest) = info.highest_id else {
                            break;
                        };
                        first.get_or_insert(low);
                        high_water = high_water.max(highest);
                        pass_bytes = info.received_bytes;
                        pass_records = info.records_exported;
                        debug!(
                            "Archived batch {}..={} (high-water {}, {} bytes staged)",
                            low, end, high_water, pass_bytes
                        );
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Archive batch {}..={} failed: {}", low, end, e);
                        break;
                    }
                }

                if !guard.refresh()? {
                    lease_lost = true;
                    break;
                }
            }

            let Some(first) = first else {
                // No progress this pass
                return Ok(());
            };

            if !self.sink.flush() {
                error!(
                    "Archive sink flush failed; keeping records {} to {}",
                    first, high_water
                );
                self.high_water.store(committed, Ordering::SeqCst);
                return Ok(());
            }

            let deleted = self.store.delete_range(first, high_water)?;
            self.high_water.store(high_water, Ordering::SeqCst);
            info!(
                "Archived and removed audit records {} to {} ({} records)",
                first, high_water, deleted
            );
            summary.passes += 1;
            summary.records_archived += pass_records;
            summary.records_deleted += deleted;
            self.emit(ArchiverEvent::Archived {
                first,
                last: high_water,
                deleted,
            });
            self.audit(
                AuditLevel::Info,
                "archive",
                &messages::ARCHIVER_COMPLETED,
                vec![first.to_string(), high_water.to_string(), deleted.to_string()],
            );

            if lease_lost {
                warn!("Archiver lease lost; ending run");
                return Ok(());
            }
            if !self.settle_delay.is_zero() {
                thread::sleep(self.settle_delay);
            }
        }
    }

    /// Start the timer thread
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<ArchiverHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let archiver = Arc::clone(self);
        let timer = thread::Builder::new()
            .name("audit-archiver-timer".to_string())
            .spawn(move || archiver.timer_loop(interval, shutdown_rx))?;
        info!("Audit archiver started (interval {:?})", interval);
        Ok(ArchiverHandle {
            shutdown: shutdown_tx,
            timer: Some(timer),
        })
    }

    fn timer_loop(self: Arc<Self>, interval: Duration, shutdown: crossbeam_channel::Receiver<()>) {
        let ticker = crossbeam_channel::tick(interval);
        let mut worker: Option<JoinHandle<()>> = None;

        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    if self.state() == ArchiverState::Halted {
                        info!("Audit archiver timer stopped (halted)");
                        break;
                    }
                    if self
                        .running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        debug!("Archive run still in progress; skipping tick");
                        continue;
                    }
                    if let Some(done) = worker.take() {
                        let _ = done.join();
                    }

                    let archiver = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name("audit-archiver-worker".to_string())
                        .spawn(move || {
                            match archiver.run_once() {
                                Ok(_) => {}
                                Err(e) if e.is_fatal() => archiver.halt(&e.to_string()),
                                Err(e) => error!("Audit archive run failed: {}", e),
                            }
                            archiver.running.store(false, Ordering::Release);
                        });
                    match spawned {
                        Ok(handle) => worker = Some(handle),
                        Err(e) => {
                            error!("Failed to start archive worker: {}", e);
                            self.running.store(false, Ordering::Release);
                        }
                    }
                }
            }
        }

        if let Some(done) = worker.take() {
            let _ = done.join();
        }
    }
}

/// Stops the archiver timer when dropped
pub struct ArchiverHandle {
    shutdown: Sender<()>,
    timer: Option<JoinHandle<()>>,
}

impl ArchiverHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    pub fn is_finished(&self) -> bool {
        self.timer.as_ref().map_or(true, |t| t.is_finished())
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl Drop for ArchiverHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
