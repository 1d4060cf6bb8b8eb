// src/config.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::{
    CalibrationCurve, CalibrationError, CalibrationPreset, MetricNames, SampleConverter,
    SchedulerSettings,
};
use crate::types::PhysicalUnit;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Which instrument feeds the pipeline; chosen once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
        /// Query sent for each reading.
        #[serde(default = "default_meter_command")]
        command: String,
    },
    AnalogScan {
        #[serde(default = "default_scan_channels")]
        channels: Vec<u8>,
        #[serde(default)]
        primary_channel: u8,
        #[serde(default = "default_scan_rate")]
        scan_rate_hz: f64,
        /// Only the simulated backend ships with this crate.
        #[serde(default = "default_true")]
        simulated: bool,
        #[serde(default = "default_sim_baseline")]
        baseline_volts: f64,
        #[serde(default = "default_sim_noise")]
        noise_volts: f64,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Serial {
            port: default_port(),
            baud: default_baud(),
            command: default_meter_command(),
        }
    }
}

impl SourceConfig {
    pub fn simulated() -> Self {
        SourceConfig::AnalogScan {
            channels: default_scan_channels(),
            primary_channel: 0,
            scan_rate_hz: default_scan_rate(),
            simulated: true,
            baseline_volts: default_sim_baseline(),
            noise_volts: default_sim_noise(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// `None` logs raw volts.
    pub preset: Option<CalibrationPreset>,
    /// Custom `(input, output)` points; wins over `preset`.
    pub table: Option<Vec<(f64, f64)>>,
    /// Multiplier applied to the raw value before lookup (V -> mV for the Varian table).
    pub input_scale: f64,
    pub unit: PhysicalUnit,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            preset: Some(CalibrationPreset::Varian9210062),
            table: None,
            input_scale: 1000.0,
            unit: PhysicalUnit::Torr,
        }
    }
}

impl CalibrationConfig {
    pub fn build(&self) -> Result<SampleConverter, CalibrationError> {
        let curve = match (&self.table, self.preset) {
            (Some(points), _) => CalibrationCurve::new(points)?,
            (None, Some(CalibrationPreset::Varian9210062)) => CalibrationCurve::varian_921_0062(),
            (None, None) => return Ok(SampleConverter::identity()),
        };
        Ok(SampleConverter::pressure(
            Arc::new(curve),
            self.input_scale,
            self.unit,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableLogConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    /// Fixed file; overrides `directory`/`file_prefix`.
    pub path: Option<PathBuf>,
    pub value_label: String,
    /// fsync after every record.
    pub sync: bool,
}

impl Default for DurableLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_prefix: "voltage_data".into(),
            path: None,
            value_label: "Pressure".into(),
            sync: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub gateway: String,
    pub job: String,
    pub publish_interval_secs: f64,
    pub timeout_ms: u64,
    pub names: MetricNames,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            gateway: "localhost:9091".into(),
            job: "voltmeter".into(),
            publish_interval_secs: 15.0,
            timeout_ms: 2000,
            names: MetricNames::default(),
        }
    }
}

impl MetricsConfig {
    pub fn publish_interval(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.publish_interval_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "metrics.publish_interval_secs must be a positive number of seconds, got {}",
                    self.publish_interval_secs
                ))
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveViewConfig {
    /// Visible width in samples.
    pub window_width: f64,
    /// Share of the window ahead of the newest sample while following.
    pub lead_fraction: f64,
    pub hold_secs: f64,
    /// Samples kept for scrolling back.
    pub history: usize,
}

impl Default for LiveViewConfig {
    fn default() -> Self {
        Self {
            window_width: 100.0,
            lead_fraction: 0.2,
            hold_secs: 5.0,
            history: 10_000,
        }
    }
}

impl LiveViewConfig {
    pub fn hold_duration(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.hold_secs).map_err(|_| {
            ConfigError::Invalid(format!(
                "live_view.hold_secs must be a non-negative number of seconds, got {}",
                self.hold_secs
            ))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tick_period_ms: u64,
    pub measure_timeout_ms: u64,
    pub max_consecutive_failures: Option<u32>,
    pub fatal_overruns: bool,
    pub rolling_window: usize,
    pub sink_deadline_ms: u64,
    pub sink_queue_depth: usize,
    pub source: SourceConfig,
    pub calibration: CalibrationConfig,
    pub durable_log: Option<DurableLogConfig>,
    pub metrics: Option<MetricsConfig>,
    pub live_view: Option<LiveViewConfig>,
    /// Stop on its own after this long.
    pub run_for_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1000,
            measure_timeout_ms: 800,
            max_consecutive_failures: None,
            fatal_overruns: false,
            rolling_window: 10,
            sink_deadline_ms: 500,
            sink_queue_depth: 4,
            source: SourceConfig::default(),
            calibration: CalibrationConfig::default(),
            durable_log: Some(DurableLogConfig::default()),
            metrics: Some(MetricsConfig::default()),
            live_view: Some(LiveViewConfig::default()),
            run_for_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.tick_period_ms == 0 {
            return invalid("tick_period_ms must be > 0".into());
        }
        if self.measure_timeout_ms == 0 || self.measure_timeout_ms >= self.tick_period_ms {
            return invalid(format!(
                "measure_timeout_ms ({}) must be > 0 and below tick_period_ms ({})",
                self.measure_timeout_ms, self.tick_period_ms
            ));
        }
        if self.rolling_window == 0 {
            return invalid("rolling_window must be >= 1".into());
        }
        if self.sink_deadline_ms == 0 {
            return invalid("sink_deadline_ms must be > 0".into());
        }
        if self.max_consecutive_failures == Some(0) {
            return invalid("max_consecutive_failures must be >= 1 when set".into());
        }
        if let SourceConfig::AnalogScan {
            channels,
            primary_channel,
            scan_rate_hz,
            ..
        } = &self.source
        {
            if !channels.contains(primary_channel) {
                return invalid(format!(
                    "primary_channel {primary_channel} is not in channels {channels:?}"
                ));
            }
            if !scan_rate_hz.is_finite() || *scan_rate_hz <= 0.0 {
                return invalid("scan_rate_hz must be a finite number > 0".into());
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.publish_interval()?;
        }
        if let Some(view) = &self.live_view {
            if !(0.0..1.0).contains(&view.lead_fraction) {
                return invalid("live_view.lead_fraction must be in [0, 1)".into());
            }
            if !view.window_width.is_finite() || view.window_width < 1.0 {
                return invalid("live_view.window_width must be a finite number >= 1".into());
            }
            view.hold_duration()?;
        }
        // Surface a bad table at load time rather than when the pipeline starts.
        self.calibration.build()?;
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn sink_deadline(&self) -> Duration {
        Duration::from_millis(self.sink_deadline_ms)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            measure_timeout: Duration::from_millis(self.measure_timeout_ms),
            max_consecutive_failures: self.max_consecutive_failures,
            fatal_overruns: self.fatal_overruns,
            sink_grace: self.sink_deadline() * 2,
        }
    }
}

fn default_port() -> String {
    if cfg!(windows) {
        r"\\.\COM3".into()
    } else {
        "/dev/ttyUSB0".into()
    }
}

fn default_baud() -> u32 {
    115_200
}

fn default_meter_command() -> String {
    "QM".into()
}

fn default_scan_channels() -> Vec<u8> {
    vec![0, 1, 2, 3]
}

fn default_scan_rate() -> f64 {
    1000.0
}

fn default_true() -> bool {
    true
}

fn default_sim_baseline() -> f64 {
    0.045
}

fn default_sim_noise() -> f64 {
    0.002
}
