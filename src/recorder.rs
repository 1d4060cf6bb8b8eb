// src/recorder.rs
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::info;

use crate::drivers::{SampleSink, SinkError};
use crate::types::{CalibratedSample, SampleEvent};

/// Append-only CSV log of calibrated samples: `Date,Time,<value label>`.
///
/// The file is opened once and kept open. The header goes in on the first write, and only if
/// the file is empty at that point, so restarting onto an existing log continues it.
pub struct DurableLogSink {
    file: File,
    path: PathBuf,
    value_label: String,
    header_checked: bool,
    sync: bool,
    records: u64,
}

impl DurableLogSink {
    pub fn open(path: impl AsRef<Path>, value_label: &str, sync: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("durable log at {}", path.display());
        Ok(Self {
            file,
            path,
            value_label: value_label.to_owned(),
            header_checked: false,
            sync,
            records: 0,
        })
    }

    /// `<dir>/<prefix>-YYYY-MM-DD_HH_MM_SS.csv`
    pub fn timestamped_path(dir: impl AsRef<Path>, prefix: &str, at: DateTime<Local>) -> PathBuf {
        dir.as_ref()
            .join(format!("{prefix}-{}.csv", at.format("%Y-%m-%d_%H_%M_%S")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Writes one record; it has reached the OS (and the disk, with `sync`) when this returns.
    pub fn append(&mut self, sample: &CalibratedSample) -> io::Result<()> {
        let mut text = String::new();
        if !self.header_checked {
            if self.file.metadata()?.len() == 0 {
                text.push_str(&format!("Date,Time,{}\n", self.value_label));
            }
            self.header_checked = true;
        }
        let stamp: DateTime<Local> = sample.timestamp.into();
        text.push_str(&format!(
            "{},{},{}\n",
            stamp.format("%Y-%m-%d"),
            stamp.format("%H:%M:%S%.3f"),
            sample.physical_value
        ));
        self.file.write_all(text.as_bytes())?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        self.records += 1;
        Ok(())
    }
}

impl SampleSink for DurableLogSink {
    fn name(&self) -> &str {
        "durable_log"
    }

    fn accept(&mut self, event: &SampleEvent, _timeout: Duration) -> Result<(), SinkError> {
        self.append(&event.sample)
            .map_err(|e| SinkError::unavailable("durable_log", e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.file
            .sync_all()
            .map_err(|e| SinkError::unavailable("durable_log", e))?;
        info!(
            "durable log closed after {} records: {}",
            self.records,
            self.path.display()
        );
        Ok(())
    }
}
