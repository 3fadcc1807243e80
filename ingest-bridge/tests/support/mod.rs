#![allow(dead_code)]

use async_trait::async_trait;
use common_events::EventEnvelope;
use ingest_bridge::{AnalyticsSink, BusError, BusSource, Delivery, Position};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays deliveries in order, then raises the shutdown flag.
pub struct FakeSource {
    deliveries: VecDeque<Delivery>,
    pub commits: Arc<AtomicUsize>,
    pub committed: Arc<Mutex<Vec<Position>>>,
    pub closed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl FakeSource {
    pub fn new(deliveries: Vec<Delivery>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            deliveries: deliveries.into(),
            commits: Arc::new(AtomicUsize::new(0)),
            committed: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }
}

#[async_trait]
impl BusSource for FakeSource {
    async fn poll(&mut self, _timeout: Duration) -> Delivery {
        match self.deliveries.pop_front() {
            Some(delivery) => delivery,
            None => {
                self.shutdown.store(true, Ordering::SeqCst);
                Delivery::Timeout
            }
        }
    }

    fn commit(&mut self, positions: &[Position]) -> Result<(), BusError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.committed.lock().unwrap().extend_from_slice(positions);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Vec<EventEnvelope>>>,
    pub failing: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self { batches: Mutex::new(Vec::new()), failing: AtomicBool::new(true) }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn ping(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    async fn insert_batch(&self, rows: &[EventEnvelope]) -> usize {
        self.batches.lock().unwrap().push(rows.to_vec());
        if self.failing.load(Ordering::SeqCst) { 0 } else { rows.len() }
    }
}
