use std::time::Duration;

use thiserror::Error;

/// Failures of a single `Source::measure` call. None of these stop the pipeline by default.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AcquisitionError {
    #[error("source did not answer within {0:?}")]
    SourceTimeout(Duration),
    #[error("hardware overrun on analog scan")]
    HardwareOverrun,
    #[error("scan buffer overrun")]
    BufferOverrun,
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("malformed instrument response: {0:?}")]
    MalformedResponse(String),
}

impl AcquisitionError {
    pub fn is_overrun(&self) -> bool {
        matches!(
            self,
            AcquisitionError::HardwareOverrun | AcquisitionError::BufferOverrun
        )
    }

    /// Short label used for counters and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionError::SourceTimeout(_) => "timeout",
            AcquisitionError::HardwareOverrun => "hardware_overrun",
            AcquisitionError::BufferOverrun => "buffer_overrun",
            AcquisitionError::DeviceUnavailable(_) => "device_unavailable",
            AcquisitionError::MalformedResponse(_) => "malformed_response",
        }
    }
}

impl From<std::io::Error> for AcquisitionError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                AcquisitionError::SourceTimeout(Duration::ZERO)
            }
            _ => AcquisitionError::DeviceUnavailable(value.to_string()),
        }
    }
}

impl From<serialport::Error> for AcquisitionError {
    fn from(value: serialport::Error) -> Self {
        AcquisitionError::DeviceUnavailable(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("invalid calibration table: {0}")]
    InvalidCalibrationTable(String),
}

/// Delivery failures of one sink for one tick; never propagated past that sink.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SinkError {
    #[error("sink `{sink}` missed its {deadline:?} deadline")]
    SinkTimeout { sink: String, deadline: Duration },
    #[error("sink `{sink}` unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },
}

impl SinkError {
    pub fn unavailable(sink: &str, reason: impl ToString) -> Self {
        SinkError::SinkUnavailable {
            sink: sink.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that terminate the pipeline.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("source exhausted after {consecutive_failures} consecutive failures (last: {last})")]
    SourceExhausted {
        consecutive_failures: u32,
        last: AcquisitionError,
    },
    #[error("overrun treated as fatal: {0}")]
    FatalOverrun(AcquisitionError),
    #[error("pipeline thread `{0}` panicked")]
    ThreadPanicked(&'static str),
}
