//! Bounded batching of parsed observations before a flush to the ingestion
//! endpoint, with flush triggers, atomic hand-off, and an overflow-drop
//! policy once the retained-items ceiling is exceeded.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::model::PriceObservation;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_age: Duration::from_secs(5),
        }
    }
}

/// Accumulates observations for one collector and decides when to flush.
pub struct Batcher {
    config: BatcherConfig,
    pending: VecDeque<PriceObservation>,
    oldest_pending_at: Option<Instant>,
    /// Count of items dropped after the retained-items ceiling was exceeded.
    pub drop_overflow: u64,
}

impl Batcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            oldest_pending_at: None,
            drop_overflow: 0,
        }
    }

    /// Ceiling on retained items across both pending pushes and a failed
    /// flush's re-enqueue, to bound memory growth during an outage.
    fn ceiling(&self) -> usize {
        self.config.max_batch_size * 2
    }

    pub fn push(&mut self, obs: PriceObservation) {
        if self.pending.is_empty() {
            self.oldest_pending_at = Some(Instant::now());
        }
        self.pending.push_back(obs);
        self.enforce_ceiling();
    }

    fn enforce_ceiling(&mut self) {
        let ceiling = self.ceiling();
        while self.pending.len() > ceiling {
            self.pending.pop_front();
            self.drop_overflow += 1;
        }
    }

    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.config.max_batch_size {
            return true;
        }
        match self.oldest_pending_at {
            Some(t) => t.elapsed() >= self.config.max_batch_age,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Atomically hands off everything pending, leaving the batcher empty.
    /// Call `reenqueue_failed` if the hand-off's consumer fails to deliver.
    pub fn take_batch(&mut self) -> Vec<PriceObservation> {
        self.oldest_pending_at = None;
        self.pending.drain(..).collect()
    }

    /// Re-enqueues a batch at the head after a failed send, exactly once per
    /// spec. Callers must not call this more than once per `take_batch`.
    pub fn reenqueue_failed(&mut self, batch: Vec<PriceObservation>) {
        if batch.is_empty() {
            return;
        }
        if self.oldest_pending_at.is_none() {
            self.oldest_pending_at = Some(Instant::now());
        }
        for obs in batch.into_iter().rev() {
            self.pending.push_front(obs);
        }
        self.enforce_ceiling();
    }
}
