use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::drivers::{AcquisitionError, Source};
use crate::types::{ChannelValue, RawReading, ReadingUnit};

/// One drain of a continuous scan buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanRead {
    /// Channel-interleaved samples: `[c0, c1, .., cN, c0, c1, ..]`.
    pub data: Vec<f64>,
    pub hardware_overrun: bool,
    pub buffer_overrun: bool,
}

/// Hardware abstraction for a continuously scanning multi-channel ADC.
///
/// The scan is configured and started before it is handed over; the pipeline only drains it
/// and stops it.
pub trait ScanHardware: Send {
    /// Scanned channels, in interleave order.
    fn channels(&self) -> &[u8];

    /// Everything acquired since the previous call.
    fn read_available(&mut self, timeout: Duration) -> Result<ScanRead, AcquisitionError>;

    fn stop(&mut self) -> Result<(), AcquisitionError>;
}

/// Source draining a scan buffer and reporting the newest sample of each channel.
pub struct AnalogScanSource<H: ScanHardware> {
    hardware: H,
    primary_channel: u8,
    primary_index: usize,
    total_samples: u64,
}

impl<H: ScanHardware> AnalogScanSource<H> {
    /// Fails when `primary_channel` is not part of the scan.
    pub fn new(hardware: H, primary_channel: u8) -> Result<Self, AcquisitionError> {
        let primary_index = hardware
            .channels()
            .iter()
            .position(|&c| c == primary_channel)
            .ok_or_else(|| {
                AcquisitionError::DeviceUnavailable(format!(
                    "channel {primary_channel} is not in the scan list {:?}",
                    hardware.channels()
                ))
            })?;
        Ok(Self {
            hardware,
            primary_channel,
            primary_index,
            total_samples: 0,
        })
    }

    /// Samples per channel drained since the source was created.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

impl<H: ScanHardware> Source for AnalogScanSource<H> {
    fn measure(&mut self, timeout: Duration) -> Result<RawReading, AcquisitionError> {
        let read = self.hardware.read_available(timeout)?;
        if read.hardware_overrun {
            return Err(AcquisitionError::HardwareOverrun);
        }
        if read.buffer_overrun {
            return Err(AcquisitionError::BufferOverrun);
        }
        let channels = self.hardware.channels();
        let per_channel = read.data.len() / channels.len();
        if per_channel == 0 {
            return Err(AcquisitionError::SourceTimeout(timeout));
        }
        self.total_samples += per_channel as u64;
        let last_row = (per_channel - 1) * channels.len();
        let latest: Vec<ChannelValue> = channels
            .iter()
            .enumerate()
            .map(|(i, &channel)| ChannelValue {
                channel,
                value: read.data[last_row + i],
            })
            .collect();
        debug!(
            "scan drained {per_channel} samples/channel ({} total)",
            self.total_samples
        );
        Ok(RawReading {
            value: latest[self.primary_index].value,
            unit: ReadingUnit::Volt,
            channels: latest,
        })
    }

    fn describe(&self) -> String {
        format!(
            "analog scan channels {:?} (primary {})",
            self.hardware.channels(),
            self.primary_channel
        )
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.hardware.stop()
    }
}

/// Software stand-in for the scan HAT: noisy DC levels at a fixed scan rate.
pub struct SimulatedScanHat {
    channels: Vec<u8>,
    scan_rate_hz: f64,
    baseline_volts: f64,
    noise_volts: f64,
    last_drain: Instant,
    running: bool,
}

impl SimulatedScanHat {
    pub fn start(channels: Vec<u8>, scan_rate_hz: f64, baseline_volts: f64, noise_volts: f64) -> Self {
        info!(
            "simulated scan started: channels {:?} @ {scan_rate_hz} Hz",
            channels
        );
        Self {
            channels,
            scan_rate_hz,
            baseline_volts,
            noise_volts: noise_volts.abs(),
            last_drain: Instant::now(),
            running: true,
        }
    }
}

impl ScanHardware for SimulatedScanHat {
    fn channels(&self) -> &[u8] {
        &self.channels
    }

    fn read_available(&mut self, _timeout: Duration) -> Result<ScanRead, AcquisitionError> {
        if !self.running {
            return Err(AcquisitionError::DeviceUnavailable("scan stopped".into()));
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_drain).as_secs_f64();
        let rows = (elapsed * self.scan_rate_hz).floor() as usize;
        if rows > 0 {
            self.last_drain = now;
        }
        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity(rows * self.channels.len());
        for _ in 0..rows {
            for (i, _) in self.channels.iter().enumerate() {
                let offset = 0.005 * i as f64;
                let noise = if self.noise_volts > 0.0 {
                    rng.gen_range(-self.noise_volts..=self.noise_volts)
                } else {
                    0.0
                };
                data.push(self.baseline_volts + offset + noise);
            }
        }
        Ok(ScanRead {
            data,
            hardware_overrun: false,
            buffer_overrun: false,
        })
    }

    fn stop(&mut self) -> Result<(), AcquisitionError> {
        self.running = false;
        info!("simulated scan stopped");
        Ok(())
    }
}
