use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vacuum_telemetry::config::{CalibrationConfig, DurableLogConfig, PipelineConfig};
use vacuum_telemetry::drivers::{
    AcquisitionError, AcquisitionScheduler, CalibrationCurve, PipelineError, PublishBatcher,
    SampleConverter, SchedulerSettings, ScriptedSource, SinkWorker, TickOutcome,
};
use vacuum_telemetry::engine;
use vacuum_telemetry::recorder::DurableLogSink;
use vacuum_telemetry::types::{PhysicalUnit, PipelineEvent, RawReading};

const LINEAR_TABLE: [(f64, f64); 3] = [(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)];

fn linear_converter() -> SampleConverter {
    let curve = CalibrationCurve::new(&LINEAR_TABLE).unwrap();
    SampleConverter::pressure(Arc::new(curve), 1.0, PhysicalUnit::Torr)
}

fn logged_values(path: &Path) -> Vec<f64> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("Date,Time,Pressure"));
    lines
        .map(|line| line.rsplit(',').next().unwrap().parse().unwrap())
        .collect()
}

#[test]
fn scenario_a_linear_calibration_and_rolling_average() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.csv");
    let log = DurableLogSink::open(&path, "Pressure", true).unwrap();
    let mut scheduler = AcquisitionScheduler::new(
        ScriptedSource::volts([1.0, 2.0, 3.0]),
        linear_converter(),
        3,
        SchedulerSettings::default(),
    )
    .with_durable_log(SinkWorker::spawn(log, Duration::from_secs(1), 8));

    let mut averages = Vec::new();
    for _ in 0..3 {
        match scheduler.tick().unwrap() {
            TickOutcome::Sampled(event) => averages.push(event.rolling_average),
            TickOutcome::Skipped(e) => panic!("unexpected skip: {e}"),
        }
    }
    assert_eq!(averages, vec![None, None, Some(20.0)]);

    let report = scheduler.shutdown();
    assert_eq!(report.sinks[0].1.delivered, 3);
    assert_eq!(logged_values(&path), vec![10.0, 20.0, 30.0]);
}

#[test]
fn scenario_b_timeout_skips_tick_without_consuming_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.csv");
    let log = DurableLogSink::open(&path, "Pressure", false).unwrap();
    let source = ScriptedSource::new(vec![
        Ok(RawReading::volts(1.0)),
        Err(AcquisitionError::SourceTimeout(Duration::from_millis(800))),
        Ok(RawReading::volts(3.0)),
    ]);
    let mut scheduler =
        AcquisitionScheduler::new(source, linear_converter(), 3, SchedulerSettings::default())
            .with_durable_log(SinkWorker::spawn(log, Duration::from_secs(1), 8));

    let mut sequences = Vec::new();
    for _ in 0..3 {
        if let TickOutcome::Sampled(event) = scheduler.tick().unwrap() {
            sequences.push(event.sample.sequence);
        }
    }
    assert_eq!(sequences, vec![0, 1]);
    assert_eq!(scheduler.stats().skipped, 1);
    // Still running: the next tick is attempted normally.
    assert!(scheduler.tick().is_ok());

    scheduler.shutdown();
    assert_eq!(logged_values(&path), vec![10.0, 30.0]);
}

#[test]
fn scenario_c_batch_aggregate() {
    let start = Instant::now();
    let mut batcher = PublishBatcher::new(Duration::from_secs(5), start);
    for _ in 0..5 {
        batcher.record(2.0);
    }
    assert!(batcher.flush_if_due(start + Duration::from_secs(4)).is_none());
    let batch = batcher.flush_if_due(start + Duration::from_secs(5)).unwrap();
    assert_eq!(batch.mean, 2.0);
    assert_eq!(batch.count, 5);
    assert_eq!(batch.measurement_rate, 1.0);
    assert_eq!(batcher.pending().count, 0);
}

fn runtime_config(log_path: &Path) -> PipelineConfig {
    PipelineConfig {
        tick_period_ms: 20,
        measure_timeout_ms: 10,
        max_consecutive_failures: Some(1),
        rolling_window: 2,
        calibration: CalibrationConfig {
            preset: None,
            table: Some(LINEAR_TABLE.to_vec()),
            input_scale: 1.0,
            unit: PhysicalUnit::Torr,
        },
        durable_log: Some(DurableLogConfig {
            path: Some(log_path.to_path_buf()),
            ..DurableLogConfig::default()
        }),
        metrics: None,
        ..PipelineConfig::default()
    }
}

#[test]
fn runtime_runs_until_source_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.csv");
    let config = runtime_config(&path);
    let (frames_tx, frames_rx) = mpsc::channel();
    let handle = engine::start(
        &config,
        ScriptedSource::volts([1.0, 2.0, 3.0, 1.5]),
        Some(frames_tx),
    )
    .unwrap();

    let fatal = loop {
        match handle.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::Fatal(e) => break e,
            _ => continue,
        }
    };
    assert!(matches!(fatal, PipelineError::SourceExhausted { .. }));

    let report = handle.stop();
    assert_eq!(report.ticks.samples, 4);
    assert_eq!(report.fatal, Some(fatal));
    let values = logged_values(&path);
    assert_eq!(values.len(), 4);
    for (got, want) in values.iter().zip([10.0, 20.0, 30.0, 15.0]) {
        assert!((got - want).abs() < 1e-9, "{got} != {want}");
    }

    let frames: Vec<_> = frames_rx.try_iter().collect();
    let sequences: Vec<u64> = frames.iter().map(|f| f.latest.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    let last = frames.last().unwrap();
    let avg = last.averages.last().unwrap();
    assert_eq!(avg.sequence, 3);
    assert!((avg.value - 22.5).abs() < 1e-9);
}

#[test]
fn runtime_stop_cancels_a_healthy_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stop.csv");
    let config = PipelineConfig {
        max_consecutive_failures: None,
        ..runtime_config(&path)
    };
    let handle = engine::start(&config, ScriptedSource::volts(vec![2.0; 1000]), None).unwrap();
    assert!(handle.viewport().is_none());
    std::thread::sleep(Duration::from_millis(120));
    let started = Instant::now();
    let report = handle.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.fatal.is_none());
    assert!(report.ticks.samples >= 2);
    let values = logged_values(&path);
    assert_eq!(values.len() as u64, report.ticks.samples);
    assert!(values.iter().all(|v| *v == 20.0));
}
