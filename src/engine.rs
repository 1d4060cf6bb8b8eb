// src/engine.rs
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{ConfigError, PipelineConfig, SourceConfig};
use crate::drivers::{
    AcquisitionError, AcquisitionScheduler, AnalogScanSource, BatchAggregate, CalibrationError,
    ChannelFrontend, LiveViewSink, MetricsSink, PipelineError, PublishBatcher, PushgatewaySink,
    RunReport, SerialMultimeterSource, SerialPortLink, SharedBatcher, SharedViewport,
    SimulatedScanHat, SinkError, SinkWorker, Source, ViewportController, ViewportState,
};
use crate::recorder::DurableLogSink;
use crate::types::{PipelineEvent, ScrollTarget, ViewFrame};

/// Longest the hold timer sleeps between checks.
const MAX_HOLD_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("failed to open source: {0}")]
    Source(#[from] AcquisitionError),
    #[error("failed to open durable log {path}: {source}")]
    DurableLog { path: PathBuf, source: io::Error },
}

/// The metrics side of the pipeline: the batcher the scheduler records into and where flushed
/// aggregates go.
pub struct Publisher {
    pub batcher: SharedBatcher,
    pub sink: Box<dyn MetricsSink>,
    pub timeout: Duration,
}

impl Publisher {
    /// One push; a failure that used up the whole timeout is reported as `SinkTimeout`.
    pub fn publish(&mut self, batch: &BatchAggregate) -> Result<(), SinkError> {
        let started = Instant::now();
        self.sink.publish(batch, self.timeout).map_err(|e| {
            if started.elapsed() >= self.timeout {
                SinkError::SinkTimeout {
                    sink: self.sink.name().to_owned(),
                    deadline: self.timeout,
                }
            } else {
                e
            }
        })
    }
}

/// Opens the configured instrument. Called once, before the pipeline starts.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn Source>, AcquisitionError> {
    match config {
        SourceConfig::Serial {
            port,
            baud,
            command,
        } => {
            let link = SerialPortLink::open(port, *baud)?;
            Ok(Box::new(SerialMultimeterSource::new(
                link,
                command.as_str(),
                port.as_str(),
            )))
        }
        SourceConfig::AnalogScan {
            channels,
            primary_channel,
            scan_rate_hz,
            simulated: true,
            baseline_volts,
            noise_volts,
        } => {
            let hat = SimulatedScanHat::start(
                channels.clone(),
                *scan_rate_hz,
                *baseline_volts,
                *noise_volts,
            );
            Ok(Box::new(AnalogScanSource::new(hat, *primary_channel)?))
        }
        SourceConfig::AnalogScan {
            simulated: false, ..
        } => Err(AcquisitionError::DeviceUnavailable(
            "no analog scan driver is available on this host; set `simulated`".into(),
        )),
    }
}

/// Wires the configured sinks around `source` and starts all timelines.
///
/// The live view is only attached when `frames` is given; the frontend then receives one
/// [`ViewFrame`] per sample.
pub fn start<S: Source + 'static>(
    config: &PipelineConfig,
    source: S,
    frames: Option<Sender<ViewFrame>>,
) -> Result<PipelineHandle, StartupError> {
    config.validate()?;
    let converter = config.calibration.build()?;
    let deadline = config.sink_deadline();
    let depth = config.sink_queue_depth;
    info!(
        "starting pipeline: {} every {:?}, values in {}",
        source.describe(),
        config.tick_period(),
        converter.unit()
    );
    let mut scheduler = AcquisitionScheduler::new(
        source,
        converter,
        config.rolling_window,
        config.scheduler_settings(),
    );

    if let Some(log) = &config.durable_log {
        let path = log.path.clone().unwrap_or_else(|| {
            DurableLogSink::timestamped_path(&log.directory, &log.file_prefix, Local::now())
        });
        let sink = DurableLogSink::open(&path, &log.value_label, log.sync)
            .map_err(|source| StartupError::DurableLog { path, source })?;
        scheduler = scheduler.with_durable_log(SinkWorker::spawn(sink, deadline, depth));
    }

    let mut publisher = None;
    if let Some(metrics) = &config.metrics {
        let batcher = PublishBatcher::shared(metrics.publish_interval()?, Instant::now());
        scheduler = scheduler.with_batcher(batcher.clone());
        publisher = Some(Publisher {
            batcher,
            sink: Box::new(PushgatewaySink::new(
                &metrics.gateway,
                &metrics.job,
                metrics.names.clone(),
            )),
            timeout: Duration::from_millis(metrics.timeout_ms),
        });
    }

    let mut viewport = None;
    if let (Some(view), Some(tx)) = (&config.live_view, frames) {
        let hold = view.hold_duration()?;
        let shared = ViewportController::shared(view.window_width, view.lead_fraction, hold);
        let sink = LiveViewSink::new(shared.clone(), ChannelFrontend::new(tx), view.history);
        scheduler = scheduler.with_live_view(SinkWorker::spawn(sink, deadline, depth));
        viewport = Some(shared);
    }

    Ok(spawn(scheduler, config.tick_period(), publisher, viewport))
}

/// Starts the acquisition timeline, plus the publish and hold timelines when their
/// collaborators are present. Each timeline runs on its own thread.
pub fn spawn<S: Source + 'static>(
    scheduler: AcquisitionScheduler<S>,
    tick_period: Duration,
    publisher: Option<Publisher>,
    viewport: Option<SharedViewport>,
) -> PipelineHandle {
    let (events_tx, events) = mpsc::channel();
    let mut stops = Vec::new();
    let mut timers = Vec::new();

    let (stop_tx, stop_rx) = mpsc::channel();
    stops.push(stop_tx);
    let tx = events_tx.clone();
    let acquisition = thread::Builder::new()
        .name("acquisition".into())
        .spawn(move || acquisition_loop(scheduler, tick_period, tx, stop_rx));

    if let Some(publisher) = publisher {
        let (stop_tx, stop_rx) = mpsc::channel();
        stops.push(stop_tx);
        let tx = events_tx.clone();
        timers.push((
            "publish",
            thread::Builder::new()
                .name("publish".into())
                .spawn(move || publish_loop(publisher, tx, stop_rx)),
        ));
    }

    if let Some(shared) = viewport.clone() {
        let (stop_tx, stop_rx) = mpsc::channel();
        stops.push(stop_tx);
        let poll = tick_period.min(MAX_HOLD_POLL);
        timers.push((
            "hold",
            thread::Builder::new()
                .name("hold".into())
                .spawn(move || hold_loop(shared, poll, stop_rx)),
        ));
    }

    let timers = timers
        .into_iter()
        .filter_map(|(name, spawned)| match spawned {
            Ok(handle) => Some((name, handle)),
            Err(e) => {
                error!("could not start the {name} timeline: {e}");
                None
            }
        })
        .collect();
    let acquisition = match acquisition {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("could not start the acquisition timeline: {e}");
            events_tx.send(PipelineEvent::Stopped).ok();
            None
        }
    };

    PipelineHandle {
        stops,
        acquisition,
        timers,
        events,
        viewport,
    }
}

/// A running pipeline. Dropping the handle without `stop` leaves the timelines running
/// detached until the process exits.
pub struct PipelineHandle {
    stops: Vec<Sender<()>>,
    acquisition: Option<JoinHandle<RunReport>>,
    timers: Vec<(&'static str, JoinHandle<()>)>,
    events: Receiver<PipelineEvent>,
    viewport: Option<SharedViewport>,
}

impl PipelineHandle {
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn viewport(&self) -> Option<&SharedViewport> {
        self.viewport.as_ref()
    }

    /// UI-interaction timeline: hold the view at `target`.
    pub fn scroll(&self, target: ScrollTarget) -> Option<ViewportState> {
        self.viewport
            .as_ref()
            .map(|v| v.lock().user_scroll(target, Instant::now()))
    }

    /// Drops a hold and goes back to following the newest sample.
    pub fn follow(&self) -> Option<ViewportState> {
        self.viewport.as_ref().map(|v| {
            let mut controller = v.lock();
            controller.release();
            controller.state()
        })
    }

    /// Cancels all timelines and waits for them. Sink workers get their grace period to
    /// drain before being abandoned.
    pub fn stop(mut self) -> RunReport {
        self.stops.clear();
        for (name, handle) in self.timers.drain(..) {
            if handle.join().is_err() {
                error!("{name} timeline panicked");
            }
        }
        let report = match self.acquisition.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => RunReport {
                fatal: Some(PipelineError::ThreadPanicked("acquisition")),
                ..RunReport::default()
            },
            None => RunReport::default(),
        };
        info!(
            "pipeline stopped after {} ticks ({} samples, {} skipped)",
            report.ticks.ticks, report.ticks.samples, report.ticks.skipped
        );
        report
    }
}

/// Waits until `deadline` or a stop request. Returns `false` when asked to stop.
fn sleep_until(stop: &Receiver<()>, deadline: Instant) -> bool {
    match stop.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Err(RecvTimeoutError::Timeout) => true,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
    }
}

fn acquisition_loop<S: Source>(
    mut scheduler: AcquisitionScheduler<S>,
    period: Duration,
    events: Sender<PipelineEvent>,
    stop: Receiver<()>,
) -> RunReport {
    let mut fatal = None;
    let mut next_tick = Instant::now();
    loop {
        if let Err(e) = scheduler.tick() {
            error!("acquisition stopped: {e}");
            events.send(PipelineEvent::Fatal(e.clone())).ok();
            fatal = Some(e);
            break;
        }
        // Fixed rate: deadlines advance by whole periods, and missed ones are dropped.
        next_tick += period;
        let now = Instant::now();
        let mut missed = 0u32;
        while next_tick <= now {
            next_tick += period;
            missed += 1;
        }
        if missed > 0 {
            warn!("tick overran its period, {missed} tick(s) dropped");
        }
        if !sleep_until(&stop, next_tick) {
            break;
        }
    }
    let mut report = scheduler.shutdown();
    report.fatal = fatal;
    events.send(PipelineEvent::Stopped).ok();
    report
}

fn publish_loop(mut publisher: Publisher, events: Sender<PipelineEvent>, stop: Receiver<()>) {
    loop {
        let due_at = {
            let batcher = publisher.batcher.lock();
            batcher.pending().started_at + batcher.publish_interval()
        };
        if !sleep_until(&stop, due_at) {
            break;
        }
        // The batch is swapped out under the lock; the lock is released before publishing.
        let Some(batch) = publisher.batcher.lock().flush_if_due(Instant::now()) else {
            debug!("publish interval ended with no samples");
            continue;
        };
        info!(
            "avg {:.4e} over {} samples, {:.3} Hz",
            batch.mean, batch.count, batch.measurement_rate
        );
        match publisher.publish(&batch) {
            Ok(()) => {
                events
                    .send(PipelineEvent::Published {
                        mean: batch.mean,
                        count: batch.count,
                        rate_hz: batch.measurement_rate,
                    })
                    .ok();
            }
            Err(e) => warn!("metrics push dropped: {e}"),
        }
    }
}

fn hold_loop(viewport: SharedViewport, poll: Duration, stop: Receiver<()>) {
    loop {
        let now = Instant::now();
        let wake = match viewport.lock().state().held_until {
            Some(until) => until.min(now + poll),
            None => now + poll,
        };
        if !sleep_until(&stop, wake) {
            break;
        }
        if viewport.lock().hold_expired(Instant::now()) {
            debug!("scroll hold expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{SampleConverter, SchedulerSettings, ScriptedSource, ViewMode};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingMetrics {
        published: Arc<Mutex<Vec<BatchAggregate>>>,
        fail: bool,
        delay: Duration,
    }

    impl MetricsSink for RecordingMetrics {
        fn name(&self) -> &str {
            "recording"
        }

        fn publish(&mut self, batch: &BatchAggregate, _timeout: Duration) -> Result<(), SinkError> {
            self.published.lock().push(batch.clone());
            thread::sleep(self.delay);
            if self.fail {
                Err(SinkError::unavailable("recording", "down"))
            } else {
                Ok(())
            }
        }
    }

    fn scheduler(values: Vec<f64>) -> AcquisitionScheduler<ScriptedSource> {
        AcquisitionScheduler::new(
            ScriptedSource::volts(values),
            SampleConverter::identity(),
            2,
            SchedulerSettings {
                measure_timeout: Duration::from_millis(5),
                ..SchedulerSettings::default()
            },
        )
    }

    #[test]
    fn stop_returns_tick_counts() {
        let handle = spawn(scheduler(vec![1.0; 100]), Duration::from_millis(10), None, None);
        thread::sleep(Duration::from_millis(60));
        let report = handle.stop();
        assert!(report.ticks.samples >= 2);
        assert!(report.fatal.is_none());
    }

    #[test]
    fn exhaustion_ends_acquisition_with_fatal_event() {
        let s = AcquisitionScheduler::new(
            ScriptedSource::volts([1.0]),
            SampleConverter::identity(),
            1,
            SchedulerSettings {
                measure_timeout: Duration::from_millis(5),
                max_consecutive_failures: Some(2),
                ..SchedulerSettings::default()
            },
        );
        let handle = spawn(s, Duration::from_millis(5), None, None);
        let event = handle.events().recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            event,
            PipelineEvent::Fatal(PipelineError::SourceExhausted { .. })
        ));
        let report = handle.stop();
        assert_eq!(report.ticks.samples, 1);
        assert!(matches!(
            report.fatal,
            Some(PipelineError::SourceExhausted {
                consecutive_failures: 2,
                ..
            })
        ));
    }

    #[test]
    fn publish_timeline_flushes_on_its_own_interval() {
        let batcher = PublishBatcher::shared(Duration::from_millis(50), Instant::now());
        let published = Arc::new(Mutex::new(Vec::new()));
        let publisher = Publisher {
            batcher: batcher.clone(),
            sink: Box::new(RecordingMetrics {
                published: published.clone(),
                fail: false,
                delay: Duration::ZERO,
            }),
            timeout: Duration::from_millis(100),
        };
        batcher.lock().record(2.0);
        batcher.lock().record(4.0);
        let s = scheduler(Vec::new());
        // An idle acquisition timeline; the source is empty and never exhausts.
        let handle = spawn(s, Duration::from_secs(10), Some(publisher), None);
        let mut seen = None;
        while let Ok(event) = handle.events().recv_timeout(Duration::from_secs(2)) {
            if let PipelineEvent::Published { mean, count, .. } = event {
                seen = Some((mean, count));
                break;
            }
        }
        handle.stop();
        assert_eq!(seen, Some((3.0, 2)));
        assert_eq!(published.lock().len(), 1);
        assert!(batcher.lock().pending().values.is_empty());
    }

    #[test]
    fn failed_publish_still_clears_the_batch() {
        let batcher = PublishBatcher::shared(Duration::from_millis(30), Instant::now());
        let published = Arc::new(Mutex::new(Vec::new()));
        let publisher = Publisher {
            batcher: batcher.clone(),
            sink: Box::new(RecordingMetrics {
                published: published.clone(),
                fail: true,
                delay: Duration::ZERO,
            }),
            timeout: Duration::from_millis(100),
        };
        batcher.lock().record(1.0);
        let handle = spawn(scheduler(Vec::new()), Duration::from_secs(10), Some(publisher), None);
        thread::sleep(Duration::from_millis(150));
        handle.stop();
        assert_eq!(published.lock().len(), 1);
        assert_eq!(batcher.lock().pending().count, 0);
    }

    #[test]
    fn slow_failed_publish_is_reported_as_timeout() {
        let start = Instant::now();
        let mut batcher = PublishBatcher::new(Duration::from_millis(10), start);
        batcher.record(1.0);
        let batch = batcher.flush_if_due(start + Duration::from_millis(10)).unwrap();
        let publisher = |delay| Publisher {
            batcher: PublishBatcher::shared(Duration::from_secs(1), start),
            sink: Box::new(RecordingMetrics {
                published: Arc::new(Mutex::new(Vec::new())),
                fail: true,
                delay,
            }),
            timeout: Duration::from_millis(20),
        };

        let slow = publisher(Duration::from_millis(40)).publish(&batch);
        assert_eq!(
            slow,
            Err(SinkError::SinkTimeout {
                sink: "recording".into(),
                deadline: Duration::from_millis(20),
            })
        );
        let fast = publisher(Duration::ZERO).publish(&batch);
        assert!(matches!(fast, Err(SinkError::SinkUnavailable { .. })));
    }

    #[test]
    fn hold_timeline_returns_view_to_following() {
        let viewport = ViewportController::shared(10.0, 0.2, Duration::from_millis(40));
        let handle = spawn(
            scheduler(Vec::new()),
            Duration::from_millis(20),
            None,
            Some(viewport.clone()),
        );
        let held = handle.scroll(ScrollTarget::Absolute(3.0)).unwrap();
        assert_eq!(held.mode, ViewMode::Held);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(viewport.lock().mode(), ViewMode::Following);
        handle.stop();
    }

    #[test]
    fn follow_releases_hold_immediately() {
        let viewport = ViewportController::shared(10.0, 0.2, Duration::from_secs(60));
        let handle = spawn(
            scheduler(Vec::new()),
            Duration::from_millis(20),
            None,
            Some(viewport),
        );
        handle.scroll(ScrollTarget::Fraction(0.5));
        let state = handle.follow().unwrap();
        assert_eq!(state.mode, ViewMode::Following);
        assert!(state.held_until.is_none());
        handle.stop();
    }
}
