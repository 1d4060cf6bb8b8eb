use std::collections::VecDeque;
use std::time::Duration;

use crate::drivers::AcquisitionError;
use crate::types::RawReading;

/// Something that yields one raw reading per call.
///
/// The scheduler never calls `measure` concurrently with itself, and every call must return
/// within `timeout`.
pub trait Source: Send {
    fn measure(&mut self, timeout: Duration) -> Result<RawReading, AcquisitionError>;

    /// Human readable identity used in log lines.
    fn describe(&self) -> String;

    /// Release the instrument once acquisition has stopped.
    fn close(&mut self) -> Result<(), AcquisitionError> {
        Ok(())
    }
}

impl Source for Box<dyn Source> {
    fn measure(&mut self, timeout: Duration) -> Result<RawReading, AcquisitionError> {
        (**self).measure(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        (**self).close()
    }
}

/// In-memory source for tests and deterministic playback.
///
/// Once the script runs out every call reports `DeviceUnavailable`.
pub struct ScriptedSource {
    queue: VecDeque<Result<RawReading, AcquisitionError>>,
    closed: bool,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Result<RawReading, AcquisitionError>>) -> Self {
        Self {
            queue: steps.into_iter().collect(),
            closed: false,
        }
    }

    /// Every step succeeds with the given voltage.
    pub fn volts(values: impl IntoIterator<Item = f64>) -> Self {
        Self::new(values.into_iter().map(|v| Ok(RawReading::volts(v))))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Source for ScriptedSource {
    fn measure(&mut self, _timeout: Duration) -> Result<RawReading, AcquisitionError> {
        self.queue
            .pop_front()
            .unwrap_or_else(|| Err(AcquisitionError::DeviceUnavailable("script exhausted".into())))
    }

    fn describe(&self) -> String {
        format!("scripted source ({} steps left)", self.queue.len())
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.closed = true;
        Ok(())
    }
}
