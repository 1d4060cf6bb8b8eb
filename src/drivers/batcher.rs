use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Values accumulated between two metrics-publication instants.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishBatch {
    pub values: Vec<f64>,
    pub started_at: Instant,
    pub count: usize,
}

impl PublishBatch {
    fn empty(started_at: Instant) -> Self {
        Self {
            values: Vec::new(),
            started_at,
            count: 0,
        }
    }
}

/// What a flush hands to the metrics sink.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchAggregate {
    pub mean: f64,
    /// Per-sample values in arrival order; index i becomes the `index="i"` label.
    pub values: Vec<f64>,
    pub count: usize,
    /// `count / publish_interval`, in Hz.
    pub measurement_rate: f64,
    pub started_at: Instant,
    pub flushed_at: Instant,
}

/// Buffers calibrated values and cuts them into per-interval aggregates.
pub struct PublishBatcher {
    batch: PublishBatch,
    publish_interval: Duration,
}

pub type SharedBatcher = Arc<Mutex<PublishBatcher>>;

impl PublishBatcher {
    pub fn new(publish_interval: Duration, now: Instant) -> Self {
        Self {
            batch: PublishBatch::empty(now),
            publish_interval,
        }
    }

    pub fn shared(publish_interval: Duration, now: Instant) -> SharedBatcher {
        Arc::new(Mutex::new(Self::new(publish_interval, now)))
    }

    pub fn publish_interval(&self) -> Duration {
        self.publish_interval
    }

    pub fn pending(&self) -> &PublishBatch {
        &self.batch
    }

    pub fn record(&mut self, value: f64) {
        self.batch.values.push(value);
        self.batch.count += 1;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.batch.started_at) >= self.publish_interval
    }

    /// Cuts the in-flight batch once `publish_interval` has elapsed since it started.
    ///
    /// The batch is replaced in one step with an empty one starting at `now`, so the next
    /// window never sees values from this one whether or not the publish that follows
    /// succeeds. An interval with no recorded values restarts the window and yields `None`.
    pub fn flush_if_due(&mut self, now: Instant) -> Option<BatchAggregate> {
        if !self.is_due(now) {
            return None;
        }
        let batch = std::mem::replace(&mut self.batch, PublishBatch::empty(now));
        if batch.count == 0 {
            return None;
        }
        let mean = batch.values.iter().sum::<f64>() / batch.count as f64;
        let measurement_rate = batch.count as f64 / self.publish_interval.as_secs_f64();
        Some(BatchAggregate {
            mean,
            values: batch.values,
            count: batch.count,
            measurement_rate,
            started_at: batch.started_at,
            flushed_at: now,
        })
    }
}
