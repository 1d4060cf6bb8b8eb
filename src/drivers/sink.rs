use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::drivers::SinkError;
use crate::types::SampleEvent;

/// Consumer of per-tick samples (durable log, live view, ...).
pub trait SampleSink: Send {
    fn name(&self) -> &str;

    /// Deliver one sample; must give up once `timeout` has elapsed.
    fn accept(&mut self, event: &SampleEvent, timeout: Duration) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl SampleSink for Box<dyn SampleSink> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn accept(&mut self, event: &SampleEvent, timeout: Duration) -> Result<(), SinkError> {
        (**self).accept(event, timeout)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub failed: u64,
    /// Deliveries that were still queued, or still running, when their deadline passed.
    pub timed_out: u64,
    /// Deliveries refused at dispatch because the sink's queue was full.
    pub dropped: u64,
    /// The worker did not finish within the shutdown grace period.
    pub abandoned: bool,
}

struct Delivery {
    event: SampleEvent,
    deadline: Instant,
}

/// Runs one sink on its own thread so a slow or failing sink cannot hold up the caller.
///
/// `dispatch` never blocks. Each delivery carries a deadline; a delivery picked up after its
/// deadline is skipped and counted as a timeout.
pub struct SinkWorker {
    name: String,
    deadline: Duration,
    tx: Option<SyncSender<Delivery>>,
    done_rx: Receiver<SinkStats>,
    handle: Option<JoinHandle<()>>,
    dropped: u64,
}

impl SinkWorker {
    pub fn spawn<S: SampleSink + 'static>(sink: S, deadline: Duration, queue_depth: usize) -> Self {
        let name = sink.name().to_owned();
        let (tx, rx) = mpsc::sync_channel::<Delivery>(queue_depth.max(1));
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("sink-{name}"))
            .spawn(move || {
                let stats = run_worker(sink, rx);
                done_tx.send(stats).ok();
            })
            .ok();
        if handle.is_none() {
            warn!("could not spawn worker for sink `{name}`; its deliveries will be dropped");
        }
        Self {
            name,
            deadline,
            tx: handle.as_ref().map(|_| tx),
            done_rx,
            handle,
            dropped: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch(&mut self, event: &SampleEvent) -> Result<(), SinkError> {
        let Some(tx) = &self.tx else {
            self.dropped += 1;
            return Err(SinkError::unavailable(&self.name, "worker not running"));
        };
        let delivery = Delivery {
            event: *event,
            deadline: Instant::now() + self.deadline,
        };
        match tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Err(SinkError::SinkTimeout {
                    sink: self.name.clone(),
                    deadline: self.deadline,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
                self.tx = None;
                Err(SinkError::unavailable(&self.name, "worker exited"))
            }
        }
    }

    /// Lets queued deliveries drain (each still bound by its own deadline) and waits up to
    /// `grace` for the worker; after that the worker is left to finish on its own.
    pub fn shutdown(mut self, grace: Duration) -> SinkStats {
        self.tx = None;
        let mut stats = match self.done_rx.recv_timeout(grace) {
            Ok(stats) => {
                if let Some(handle) = self.handle.take() {
                    handle.join().ok();
                }
                stats
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("sink `{}` still busy after {grace:?}; abandoning it", self.name);
                SinkStats {
                    abandoned: true,
                    ..SinkStats::default()
                }
            }
            Err(RecvTimeoutError::Disconnected) => SinkStats::default(),
        };
        stats.dropped += self.dropped;
        stats
    }
}

fn run_worker<S: SampleSink>(mut sink: S, rx: Receiver<Delivery>) -> SinkStats {
    let mut stats = SinkStats::default();
    for delivery in rx.iter() {
        let now = Instant::now();
        let Some(remaining) = delivery.deadline.checked_duration_since(now).filter(|d| !d.is_zero())
        else {
            stats.timed_out += 1;
            warn!(
                "sink `{}` skipped sample {}: deadline passed while queued",
                sink.name(),
                delivery.event.sample.sequence
            );
            continue;
        };
        match sink.accept(&delivery.event, remaining) {
            Ok(()) if Instant::now() > delivery.deadline => {
                stats.timed_out += 1;
                warn!(
                    "sink `{}` finished sample {} after its deadline",
                    sink.name(),
                    delivery.event.sample.sequence
                );
            }
            Ok(()) => stats.delivered += 1,
            Err(e) => {
                stats.failed += 1;
                warn!("{e}");
            }
        }
    }
    if let Err(e) = sink.close() {
        warn!("closing sink `{}`: {e}", sink.name());
    }
    debug!("sink `{}` worker exiting: {stats:?}", sink.name());
    stats
}
