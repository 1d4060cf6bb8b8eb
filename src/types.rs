// src/types.rs
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::drivers::{PipelineError, ViewportState};

/// Unit a source reports its raw value in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingUnit {
    Volt,
    Count,
}

/// Unit of a calibrated value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalUnit {
    Torr,
    Mbar,
    Volt,
}

impl fmt::Display for PhysicalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalUnit::Torr => write!(f, "Torr"),
            PhysicalUnit::Mbar => write!(f, "mbar"),
            PhysicalUnit::Volt => write!(f, "V"),
        }
    }
}

/// Latest value seen on one scanned channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelValue {
    pub channel: u8,
    pub value: f64,
}

/// What a source hands back before the scheduler stamps it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawReading {
    pub value: f64,
    pub unit: ReadingUnit,
    /// Most recent value per subscribed channel; empty for single-channel sources.
    pub channels: Vec<ChannelValue>,
}

impl RawReading {
    pub fn volts(value: f64) -> Self {
        Self {
            value,
            unit: ReadingUnit::Volt,
            channels: Vec::new(),
        }
    }
}

/// One raw measurement, stamped by the scheduler. `sequence` is the ordering key.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub raw_value: f64,
    pub unit: ReadingUnit,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibratedSample {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub physical_value: f64,
    pub physical_unit: PhysicalUnit,
}

/// Everything a per-sample sink receives for one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleEvent {
    pub sample: CalibratedSample,
    pub rolling_average: Option<f64>,
}

/// Single point on the live view's x (sequence) / y (value) plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplePoint {
    pub sequence: u64,
    pub value: f64,
}

/// Render-ready snapshot handed to the live view frontend.
#[derive(Clone, Debug)]
pub struct ViewFrame {
    pub latest: CalibratedSample,
    pub viewport: ViewportState,
    /// Calibrated samples inside `[viewport.lower, viewport.upper]`.
    pub samples: Vec<SamplePoint>,
    /// Rolling averages inside the same bounds.
    pub averages: Vec<SamplePoint>,
}

/// Where a user asked the view to scroll to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScrollTarget {
    /// Left edge expressed as a fraction (0..=1) of the recorded history.
    Fraction(f64),
    /// Left edge in sequence units.
    Absolute(f64),
}

/// Messages the running pipeline sends back to whoever started it.
#[derive(Debug)]
pub enum PipelineEvent {
    Published { mean: f64, count: usize, rate_hz: f64 },
    Fatal(PipelineError),
    Stopped,
}
