use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::drivers::{
    AcquisitionError, PipelineError, RollingWindow, SampleConverter, SharedBatcher, SinkStats,
    SinkWorker, Source,
};
use crate::types::{CalibratedSample, Reading, SampleEvent};

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    /// Timeout handed to every `Source::measure` call; keep it below the tick period.
    pub measure_timeout: Duration,
    /// `None` never gives up on a failing source.
    pub max_consecutive_failures: Option<u32>,
    /// Treat hardware/buffer overruns as fatal instead of skipping the tick.
    pub fatal_overruns: bool,
    /// How long `shutdown` waits for each sink worker to drain.
    pub sink_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            measure_timeout: Duration::from_millis(800),
            max_consecutive_failures: None,
            fatal_overruns: false,
            sink_grace: Duration::from_secs(2),
        }
    }
}

/// Counters for the acquisition timeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub samples: u64,
    pub skipped: u64,
    pub timeouts: u64,
    pub hardware_overruns: u64,
    pub buffer_overruns: u64,
    pub device_unavailable: u64,
    pub malformed: u64,
    pub consecutive_failures: u32,
    /// Deliveries a sink refused at dispatch (queue full or worker gone).
    pub sink_refusals: u64,
}

impl TickStats {
    fn record_failure(&mut self, error: &AcquisitionError) {
        self.skipped += 1;
        self.consecutive_failures += 1;
        match error {
            AcquisitionError::SourceTimeout(_) => self.timeouts += 1,
            AcquisitionError::HardwareOverrun => self.hardware_overruns += 1,
            AcquisitionError::BufferOverrun => self.buffer_overruns += 1,
            AcquisitionError::DeviceUnavailable(_) => self.device_unavailable += 1,
            AcquisitionError::MalformedResponse(_) => self.malformed += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Sampled(SampleEvent),
    /// The source failed; no sequence number was used.
    Skipped(AcquisitionError),
}

/// Final counters once the scheduler has shut down.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub ticks: TickStats,
    pub sinks: Vec<(String, SinkStats)>,
    /// Why acquisition ended on its own, if it did.
    pub fatal: Option<PipelineError>,
}

/// One tick = measure, stamp, calibrate, average, fan out.
///
/// Fan-out order is fixed: durable log, publish batcher, live view. Sink workers take their
/// copy without blocking, so a stalled sink only loses its own deliveries.
pub struct AcquisitionScheduler<S: Source> {
    source: S,
    converter: SampleConverter,
    window: RollingWindow,
    settings: SchedulerSettings,
    next_sequence: u64,
    stats: TickStats,
    durable_log: Option<SinkWorker>,
    batcher: Option<SharedBatcher>,
    live_view: Option<SinkWorker>,
}

impl<S: Source> AcquisitionScheduler<S> {
    pub fn new(
        source: S,
        converter: SampleConverter,
        window_capacity: usize,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            source,
            converter,
            window: RollingWindow::new(window_capacity),
            settings,
            next_sequence: 0,
            stats: TickStats::default(),
            durable_log: None,
            batcher: None,
            live_view: None,
        }
    }

    pub fn with_durable_log(mut self, worker: SinkWorker) -> Self {
        self.durable_log = Some(worker);
        self
    }

    pub fn with_batcher(mut self, batcher: SharedBatcher) -> Self {
        self.batcher = Some(batcher);
        self
    }

    pub fn with_live_view(mut self, worker: SinkWorker) -> Self {
        self.live_view = Some(worker);
        self
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn rolling_average(&self) -> Option<f64> {
        self.window.average()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn tick(&mut self) -> Result<TickOutcome, PipelineError> {
        self.stats.ticks += 1;
        let raw = match self.source.measure(self.settings.measure_timeout) {
            Ok(raw) => raw,
            Err(error) => return self.skip(error),
        };
        self.stats.consecutive_failures = 0;
        self.stats.samples += 1;
        let reading = Reading {
            sequence: self.next_sequence,
            timestamp: SystemTime::now(),
            raw_value: raw.value,
            unit: raw.unit,
        };
        self.next_sequence += 1;
        let physical_value = self.converter.convert(&reading);
        self.window.push(physical_value);
        let event = SampleEvent {
            sample: CalibratedSample {
                sequence: reading.sequence,
                timestamp: reading.timestamp,
                physical_value,
                physical_unit: self.converter.unit(),
            },
            rolling_average: self.window.average(),
        };
        debug!(
            "sample {}: raw {} -> {} {}",
            reading.sequence, reading.raw_value, physical_value, event.sample.physical_unit
        );
        self.fan_out(&event);
        Ok(TickOutcome::Sampled(event))
    }

    fn skip(&mut self, error: AcquisitionError) -> Result<TickOutcome, PipelineError> {
        self.stats.record_failure(&error);
        warn!(
            "tick {} skipped ({}): {error}",
            self.stats.ticks,
            error.kind()
        );
        if self.settings.fatal_overruns && error.is_overrun() {
            return Err(PipelineError::FatalOverrun(error));
        }
        if let Some(limit) = self.settings.max_consecutive_failures {
            if self.stats.consecutive_failures >= limit {
                return Err(PipelineError::SourceExhausted {
                    consecutive_failures: self.stats.consecutive_failures,
                    last: error,
                });
            }
        }
        Ok(TickOutcome::Skipped(error))
    }

    fn fan_out(&mut self, event: &SampleEvent) {
        if let Some(log) = self.durable_log.as_mut() {
            if let Err(e) = log.dispatch(event) {
                self.stats.sink_refusals += 1;
                warn!("{e}");
            }
        }
        if let Some(batcher) = &self.batcher {
            batcher.lock().record(event.sample.physical_value);
        }
        if let Some(view) = self.live_view.as_mut() {
            if let Err(e) = view.dispatch(event) {
                self.stats.sink_refusals += 1;
                warn!("{e}");
            }
        }
    }

    /// Drains the sink workers and releases the source.
    pub fn shutdown(mut self) -> RunReport {
        if let Err(e) = self.source.close() {
            warn!("closing {}: {e}", self.source.describe());
        }
        let grace = self.settings.sink_grace;
        let sinks = [self.durable_log.take(), self.live_view.take()]
            .into_iter()
            .flatten()
            .map(|worker| {
                let name = worker.name().to_owned();
                (name, worker.shutdown(grace))
            })
            .collect();
        RunReport {
            ticks: self.stats,
            sinks,
            fatal: None,
        }
    }
}
