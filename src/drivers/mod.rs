// src/drivers/mod.rs
pub mod analog_scan;
pub mod batcher;
pub mod calibration;
pub mod error;
pub mod live_view;
pub mod metrics;
pub mod pipeline;
pub mod rolling;
pub mod serial_meter;
pub mod sink;
pub mod source;
pub mod viewport;

pub use analog_scan::{AnalogScanSource, ScanHardware, ScanRead, SimulatedScanHat};
pub use batcher::{BatchAggregate, PublishBatch, PublishBatcher, SharedBatcher};
pub use calibration::{
    convert_pressure, CalibrationCurve, CalibrationPreset, SampleConverter, TORR_TO_MBAR,
    VARIAN_921_0062,
};
pub use error::{AcquisitionError, CalibrationError, PipelineError, SinkError};
pub use live_view::{ChannelFrontend, LiveViewSink, ViewFrontend};
pub use metrics::{render_exposition, MetricNames, MetricsSink, PushgatewaySink};
pub use pipeline::{AcquisitionScheduler, RunReport, SchedulerSettings, TickOutcome, TickStats};
pub use rolling::RollingWindow;
pub use serial_meter::{parse_meter_response, MeterLink, SerialMultimeterSource, SerialPortLink};
pub use sink::{SampleSink, SinkStats, SinkWorker};
pub use source::{ScriptedSource, Source};
pub use viewport::{SharedViewport, ViewMode, ViewportController, ViewportState};
