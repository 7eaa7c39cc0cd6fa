use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::seen::SeenLedgerStore;
use crate::seen::{SeenLedgerKey, normalize_comment_ids};
use crate::util::now_ms;

const DEFAULT_FLUSH_THRESHOLD: usize = 1_000;
const DEFAULT_FLUSH_CONCURRENCY: usize = 8;

/// Accumulation key inside one tenant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeenBatchKey {
    pub user_id: String,
    pub story_id: String,
}

impl SeenBatchKey {
    pub fn new(user_id: impl Into<String>, story_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            story_id: story_id.into(),
        }
    }

    pub fn ledger_key(&self, tenant_id: &str) -> SeenLedgerKey {
        SeenLedgerKey::new(tenant_id, &self.story_id, &self.user_id)
    }
}

#[derive(Clone, Debug)]
pub struct SeenBatchConfig {
    /// Pending marks at which waiting flushers are woken early. Zero disables
    /// the early wake-up.
    pub flush_threshold: usize,
    pub flush_concurrency: usize,
}

impl Default for SeenBatchConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_concurrency: DEFAULT_FLUSH_CONCURRENCY,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Keys drained this cycle that carried at least one comment id.
    pub keys: usize,
    /// Merges the store acknowledged.
    pub writes: usize,
    pub marks_applied: usize,
    pub failed_writes: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }
}

/// Collects "comment seen" events for one tenant and persists them as one
/// merge per (user, story) per flush.
pub struct SeenBatchAccumulator {
    tenant_id: String,
    store: Arc<dyn SeenLedgerStore>,
    config: SeenBatchConfig,
    pending: DashMap<SeenBatchKey, Vec<String>>,
    pending_marks: AtomicUsize,
    threshold_signal: Notify,
}

impl SeenBatchAccumulator {
    pub fn new(
        tenant_id: impl Into<String>,
        store: Arc<dyn SeenLedgerStore>,
        config: SeenBatchConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            store,
            config,
            pending: DashMap::new(),
            pending_marks: AtomicUsize::new(0),
            threshold_signal: Notify::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn config(&self) -> &SeenBatchConfig {
        &self.config
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_marks(&self) -> usize {
        self.pending_marks.load(Ordering::SeqCst)
    }

    /// Queues one mark. Returns true when the pending count has reached the
    /// flush threshold.
    pub fn record(&self, user_id: &str, story_id: &str, comment_id: &str) -> bool {
        // comment ids are opaque: blank ones are rejected, the rest are kept as given
        let (user_id, story_id) = (user_id.trim(), story_id.trim());
        if user_id.is_empty() || story_id.is_empty() || comment_id.trim().is_empty() {
            tracing::warn!(
                tenant_id = %self.tenant_id,
                user_id,
                story_id,
                comment_id,
                "ignoring seen event with a blank id"
            );
            return false;
        }

        // counted before the push so a concurrent drain never subtracts a
        // mark that was not yet counted
        let pending = self.pending_marks.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending
            .entry(SeenBatchKey::new(user_id, story_id))
            .or_default()
            .push(comment_id.to_string());

        let threshold = self.config.flush_threshold;
        if threshold > 0 && pending >= threshold {
            self.threshold_signal.notify_one();
            return true;
        }
        false
    }

    /// Resolves once `record` has reached the flush threshold.
    pub async fn notified(&self) {
        self.threshold_signal.notified().await;
    }

    pub async fn flush(&self, now_ms: i64) -> FlushReport {
        let keys: Vec<SeenBatchKey> = self.pending.iter().map(|entry| entry.key().clone()).collect();

        let mut batches = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((key, comment_ids)) = self.pending.remove(&key) else {
                continue;
            };
            let drained = comment_ids.len();
            let _ = self
                .pending_marks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                    Some(value.saturating_sub(drained))
                });
            let comment_ids = normalize_comment_ids(comment_ids);
            if comment_ids.is_empty() {
                continue;
            }
            batches.push((key, comment_ids));
        }

        let mut report = FlushReport {
            keys: batches.len(),
            ..FlushReport::default()
        };
        if batches.is_empty() {
            return report;
        }

        let tenant_id = self.tenant_id.as_str();
        let store = &self.store;
        let outcomes: Vec<_> = stream::iter(batches)
            .map(|(key, comment_ids)| async move {
                let ledger_key = key.ledger_key(tenant_id);
                let outcome = store.merge_seen(&ledger_key, &comment_ids, now_ms).await;
                (key, comment_ids.len(), outcome)
            })
            .buffer_unordered(self.config.flush_concurrency.max(1))
            .collect()
            .await;

        for (key, requested, outcome) in outcomes {
            match outcome {
                Ok(0) => {
                    report.failed_writes += 1;
                    tracing::warn!(
                        tenant_id,
                        user_id = %key.user_id,
                        story_id = %key.story_id,
                        requested,
                        "seen merge was not acknowledged; marks dropped"
                    );
                }
                Ok(applied) => {
                    report.writes += 1;
                    report.marks_applied += applied;
                }
                Err(err) => {
                    report.failed_writes += 1;
                    tracing::warn!(
                        tenant_id,
                        user_id = %key.user_id,
                        story_id = %key.story_id,
                        requested,
                        error = %err,
                        "seen merge failed; marks dropped"
                    );
                }
            }
        }

        tracing::debug!(
            tenant_id,
            keys = report.keys,
            writes = report.writes,
            marks_applied = report.marks_applied,
            failed_writes = report.failed_writes,
            "seen flush cycle complete"
        );
        report
    }
}

/// One "comment seen" event as delivered to the intake channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeenEvent {
    pub user_id: String,
    pub story_id: String,
    pub comment_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntakeReport {
    pub received: usize,
    pub threshold_signals: usize,
}

/// Feeds events from `events` into the accumulator until every sender is
/// dropped. Marks left pending are drained by the scheduler's final flush.
pub async fn run_intake(
    accumulator: Arc<SeenBatchAccumulator>,
    mut events: mpsc::Receiver<SeenEvent>,
) -> IntakeReport {
    let mut report = IntakeReport::default();
    while let Some(event) = events.recv().await {
        report.received += 1;
        if accumulator.record(&event.user_id, &event.story_id, &event.comment_id) {
            report.threshold_signals += 1;
        }
    }
    tracing::debug!(
        tenant_id = %accumulator.tenant_id(),
        received = report.received,
        "seen intake closed"
    );
    report
}

pub type FlushObserver = Arc<dyn Fn(&FlushReport, Duration) + Send + Sync>;

/// Drives `SeenBatchAccumulator::flush` on an interval and whenever the
/// accumulator signals its threshold, then drains once more on shutdown.
pub struct SeenFlushScheduler {
    accumulator: Arc<SeenBatchAccumulator>,
    interval: Duration,
    observer: Option<FlushObserver>,
}

impl SeenFlushScheduler {
    pub fn new(accumulator: Arc<SeenBatchAccumulator>, interval: Duration) -> Self {
        Self {
            accumulator,
            interval,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: FlushObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn spawn(self) -> SeenFlushHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = self.accumulator.notified() => {}
                }
                self.run_cycle().await;
            }

            let report = self.run_cycle().await;
            tracing::info!(
                tenant_id = %self.accumulator.tenant_id(),
                marks_applied = report.marks_applied,
                failed_writes = report.failed_writes,
                "seen flush scheduler drained"
            );
            report
        });
        SeenFlushHandle { shutdown, task }
    }

    async fn run_cycle(&self) -> FlushReport {
        let started = Instant::now();
        let report = self.accumulator.flush(now_ms()).await;
        if let Some(observer) = &self.observer {
            observer(&report, started.elapsed());
        }
        report
    }
}

pub struct SeenFlushHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<FlushReport>,
}

impl SeenFlushHandle {
    /// Stops the scheduler and returns the report of its final drain.
    pub async fn shutdown(self) -> DomainResult<FlushReport> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|err| DomainError::Unavailable(format!("flush scheduler task failed: {err}")))
    }
}
