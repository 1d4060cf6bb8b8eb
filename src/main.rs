// src/main.rs
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};

use vacuum_telemetry::cli::{Command, Interaction};
use vacuum_telemetry::config::PipelineConfig;
use vacuum_telemetry::drivers::ViewMode;
use vacuum_telemetry::engine::{self, PipelineHandle};
use vacuum_telemetry::types::{PipelineEvent, ViewFrame};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match Command::parse(&args)? {
        Command::Help => {
            print!("{}", Command::help());
            return Ok(());
        }
        Command::Version => {
            println!("vacuum-telemetry {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Run(opts) => opts,
    };

    let level = opts.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &opts.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    opts.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let source = engine::open_source(&config.source).context("opening the instrument")?;
    let (frames_tx, frames_rx) = mpsc::channel();
    let handle = engine::start(&config, source, Some(frames_tx)).context("starting the pipeline")?;

    thread::spawn(move || print_frames(frames_rx));
    let interactions = spawn_stdin_reader();
    let run_until = config
        .run_for_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    supervise(&handle, &interactions, run_until);

    let report = handle.stop();
    for (name, stats) in &report.sinks {
        info!(
            "{name}: {} delivered, {} failed, {} timed out, {} dropped{}",
            stats.delivered,
            stats.failed,
            stats.timed_out,
            stats.dropped,
            if stats.abandoned { ", abandoned" } else { "" }
        );
    }
    match report.fatal {
        Some(e) => Err(e).context("acquisition ended"),
        None => Ok(()),
    }
}

/// Main-thread loop: relays pipeline events and user input until something asks to stop.
fn supervise(
    handle: &PipelineHandle,
    interactions: &Receiver<Interaction>,
    run_until: Option<Instant>,
) {
    loop {
        match handle.events().recv_timeout(Duration::from_millis(100)) {
            Ok(PipelineEvent::Published {
                mean,
                count,
                rate_hz,
            }) => info!("pushed avg {mean:.4e} ({count} samples, {rate_hz:.3} Hz)"),
            Ok(PipelineEvent::Fatal(e)) => {
                warn!("stopping: {e}");
                return;
            }
            Ok(PipelineEvent::Stopped) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        for interaction in interactions.try_iter() {
            match interaction {
                Interaction::Scroll(target) => {
                    if handle.scroll(target).is_none() {
                        warn!("live view is disabled");
                    }
                }
                Interaction::Follow => {
                    handle.follow();
                }
                Interaction::Quit => return,
            }
        }
        if run_until.is_some_and(|t| Instant::now() >= t) {
            info!("run time elapsed");
            return;
        }
    }
}

fn spawn_stdin_reader() -> Receiver<Interaction> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match Interaction::parse(&line) {
                Some(interaction) => {
                    if tx.send(interaction).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!("commands: scroll <percent> | follow | quit"),
            }
        }
    });
    rx
}

/// Console frontend: one line per sample.
fn print_frames(frames: Receiver<ViewFrame>) {
    for frame in frames {
        let sample = frame.latest;
        let avg = frame
            .averages
            .last()
            .filter(|p| p.sequence == sample.sequence)
            .map(|p| format!("{:.4e}", p.value))
            .unwrap_or_else(|| "-".into());
        let mode = match frame.viewport.mode {
            ViewMode::Following => "follow",
            ViewMode::Held => "held",
        };
        println!(
            "#{:<6} {:.4e} {} avg {} view [{:.0}, {:.0}] {mode} ({} visible)",
            sample.sequence,
            sample.physical_value,
            sample.physical_unit,
            avg,
            frame.viewport.lower,
            frame.viewport.upper,
            frame.samples.len()
        );
    }
}
