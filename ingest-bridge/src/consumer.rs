use crate::bus::{BusSource, Delivery, Position};
use crate::metrics::Metrics;
use crate::sink::AnalyticsSink;
use chrono::Utc;
use common_events::{wire, EventEnvelope};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_size: usize,
    pub max_age: Duration,
    pub poll_timeout: Duration,
    /// Consumer-level flushes of one batch before it is dropped. Each flush runs the
    /// sink's own retry budget.
    pub max_flush_attempts: u32,
    pub progress_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_age: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            max_flush_attempts: 1,
            progress_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Draining,
    Stopped,
}

type PartitionKey = (String, i32);

/// Events waiting for one bulk write, in delivery order.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<EventEnvelope>,
    /// First and last offset read per partition since the last clear, skipped messages included.
    spans: BTreeMap<PartitionKey, (i64, i64)>,
    opened_at: Option<Instant>,
    failed_flushes: u32,
}

impl Batch {
    pub fn push(&mut self, event: EventEnvelope, now: Instant) {
        if self.events.is_empty() {
            self.opened_at = Some(now);
        }
        self.events.push(event);
    }

    pub fn track(&mut self, position: &Position) {
        self.spans
            .entry((position.topic.clone(), position.partition))
            .and_modify(|(first, last)| {
                *first = (*first).min(position.offset);
                *last = (*last).max(position.offset);
            })
            .or_insert((position.offset, position.offset));
    }

    pub fn len(&self) -> usize { self.events.len() }
    pub fn is_empty(&self) -> bool { self.events.is_empty() }
    pub fn events(&self) -> &[EventEnvelope] { &self.events }

    pub fn is_expired(&self, max_age: Duration, now: Instant) -> bool {
        self.opened_at.is_some_and(|opened| now.duration_since(opened) >= max_age)
    }

    fn clear(&mut self) {
        self.events.clear();
        self.spans.clear();
        self.opened_at = None;
        self.failed_flushes = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Committed,
    /// Written but the commit failed; messages will be redelivered.
    Uncommitted,
    Retained,
    Dropped,
}

struct Progress {
    last_report: Instant,
    last_consumed: u64,
}

/// Poll, decode, batch, flush, commit. Runs on a single task; only one batch is ever in flight.
pub struct BatchConsumer<B, S: ?Sized> {
    source: B,
    sink: Arc<S>,
    metrics: Arc<Metrics>,
    settings: BatchSettings,
    batch: Batch,
    /// Lowest offset per partition that belongs to a dropped batch. Commits never pass it,
    /// so those messages come back after a restart.
    held: BTreeMap<PartitionKey, i64>,
    state: ConsumerState,
    progress: Progress,
}

impl<B, S> BatchConsumer<B, S>
where
    B: BusSource,
    S: AnalyticsSink + ?Sized,
{
    pub fn new(source: B, sink: Arc<S>, metrics: Arc<Metrics>, settings: BatchSettings) -> Self {
        Self {
            source,
            sink,
            metrics,
            settings,
            batch: Batch::default(),
            held: BTreeMap::new(),
            state: ConsumerState::Consuming,
            progress: Progress { last_report: Instant::now(), last_consumed: 0 },
        }
    }

    pub fn state(&self) -> ConsumerState { self.state }
    pub fn batch(&self) -> &Batch { &self.batch }

    /// Consumes until `shutdown` is set, then drains. Shutdown latency is bounded by the
    /// poll timeout plus any in-flight insert.
    pub async fn run(&mut self, shutdown: &AtomicBool) {
        info!(
            max_size = self.settings.max_size,
            max_age_ms = self.settings.max_age.as_millis() as u64,
            "batch consumer started"
        );
        while !shutdown.load(Ordering::SeqCst) && self.state == ConsumerState::Consuming {
            self.step().await;
            self.report_progress(false);
        }
        self.drain().await;
    }

    /// One loop iteration: re-flush a retained batch, or poll once and act on the result.
    pub async fn step(&mut self) {
        if self.state != ConsumerState::Consuming {
            return;
        }
        if self.batch.failed_flushes > 0 {
            self.flush().await;
            return;
        }
        match self.source.poll(self.settings.poll_timeout).await {
            Delivery::Timeout => {
                self.metrics.set_bus_connected(self.source.is_connected());
                if self.batch.is_expired(self.settings.max_age, Instant::now()) {
                    self.flush().await;
                }
            }
            Delivery::Message(record) => {
                self.metrics.set_bus_connected(true);
                self.batch.track(&record.position);
                if let Some(event) = self.decode(&record.payload) {
                    self.batch.push(event, Instant::now());
                    self.metrics.record_consume(1);
                }
                if self.batch.len() >= self.settings.max_size
                    || self.batch.is_expired(self.settings.max_age, Instant::now())
                {
                    self.flush().await;
                }
            }
            Delivery::Error(reason) => {
                warn!(error = %reason, "bus poll error");
                self.metrics.record_error(1);
                self.metrics.set_bus_connected(false);
            }
        }
    }

    /// Decodes and normalizes one payload; undecodable payloads are counted and skipped.
    pub fn decode(&self, payload: &[u8]) -> Option<EventEnvelope> {
        match wire::decode(payload) {
            Ok(mut event) => {
                wire::normalize_for_sink(&mut event, Utc::now());
                Some(event)
            }
            Err(err) => {
                warn!(error = %err, bytes = payload.len(), "skipping undecodable governance event");
                self.metrics.record_error(1);
                None
            }
        }
    }

    /// Hands the batch to the sink. Offsets are committed only when every row was inserted.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let len = self.batch.len();
        let inserted = self.sink.insert_batch(self.batch.events()).await;
        if inserted == len {
            self.metrics.record_insert(len as u64);
            self.metrics.set_sink_connected(true);
            let positions = self.commit_positions();
            self.batch.clear();
            return match self.source.commit(&positions) {
                Ok(()) => {
                    debug!(batch_len = len, "offsets committed");
                    FlushOutcome::Committed
                }
                Err(err) => {
                    warn!(error = %err, batch_len = len, "offset commit failed; batch will be redelivered");
                    self.metrics.record_error(1);
                    FlushOutcome::Uncommitted
                }
            };
        }

        self.metrics.set_sink_connected(false);
        self.batch.failed_flushes += 1;
        if self.batch.failed_flushes >= self.settings.max_flush_attempts {
            error!(
                batch_len = len,
                inserted,
                flushes = self.batch.failed_flushes,
                "dropping batch; offsets left uncommitted for redelivery"
            );
            self.metrics.record_error(len as u64);
            self.hold_back();
            self.batch.clear();
            FlushOutcome::Dropped
        } else {
            warn!(batch_len = len, inserted, flushes = self.batch.failed_flushes, "flush failed; retaining batch");
            FlushOutcome::Retained
        }
    }

    /// Stops polling, makes one last flush attempt, and closes the subscription.
    pub async fn drain(&mut self) {
        if self.state == ConsumerState::Stopped {
            return;
        }
        self.transition(ConsumerState::Draining);
        if !self.batch.is_empty() {
            let outcome = self.flush().await;
            info!(?outcome, "final flush");
            if outcome == FlushOutcome::Retained {
                // No more chances after shutdown.
                let len = self.batch.len() as u64;
                self.metrics.record_error(len);
                self.hold_back();
                self.batch.clear();
            }
        }
        self.source.close();
        self.transition(ConsumerState::Stopped);
        self.report_progress(true);
    }

    /// Next offset to read per partition, capped at any offset held back by a dropped batch.
    fn commit_positions(&self) -> Vec<Position> {
        self.batch
            .spans
            .iter()
            .map(|((topic, partition), (_, last))| {
                let next = last + 1;
                let offset = match self.held.get(&(topic.clone(), *partition)) {
                    Some(held) if *held < next => {
                        debug!(topic = %topic, partition, held, "commit held back by dropped batch");
                        *held
                    }
                    _ => next,
                };
                Position::new(topic.clone(), *partition, offset)
            })
            .collect()
    }

    fn hold_back(&mut self) {
        for (key, (first, _)) in &self.batch.spans {
            self.held
                .entry(key.clone())
                .and_modify(|held| *held = (*held).min(*first))
                .or_insert(*first);
        }
    }

    fn transition(&mut self, next: ConsumerState) {
        info!(from = ?self.state, to = ?next, "consumer state change");
        self.state = next;
    }

    fn report_progress(&mut self, force: bool) {
        let elapsed = self.progress.last_report.elapsed();
        if !force && elapsed < self.settings.progress_interval {
            return;
        }
        let snap = self.metrics.snapshot();
        let delta = snap.events_consumed.saturating_sub(self.progress.last_consumed);
        let rate = (delta as f64 / elapsed.as_secs_f64().max(0.001) * 10.0).round() / 10.0;
        info!(
            consumed = snap.events_consumed,
            inserted = snap.events_inserted,
            errors = snap.errors,
            batches = snap.batches_flushed,
            pending = self.batch.len(),
            events_per_sec = rate,
            "ingest progress"
        );
        self.progress = Progress { last_report: Instant::now(), last_consumed: snap.events_consumed };
    }
}
