use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use crate::drivers::{AcquisitionError, Source};
use crate::types::{RawReading, ReadingUnit};

/// Request/response link to a single scalar instrument.
pub trait MeterLink: Send {
    fn query(&mut self, command: &str, timeout: Duration) -> Result<String, AcquisitionError>;
    fn reset(&mut self) -> Result<(), AcquisitionError>;
    fn flush(&mut self) -> Result<(), AcquisitionError>;
}

/// `MeterLink` over a serial port speaking a line-terminated ASCII protocol.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialPortLink {
    pub fn open(port_name: &str, baud: u32) -> Result<Self, AcquisitionError> {
        let port = serialport::new(port_name, baud)
            .timeout(Duration::from_millis(100))
            .open()?;
        info!("opened serial meter on {port_name} @ {baud} baud");
        Ok(Self {
            port,
            name: port_name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MeterLink for SerialPortLink {
    fn query(&mut self, command: &str, timeout: Duration) -> Result<String, AcquisitionError> {
        let deadline = Instant::now() + timeout;
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;
        let mut line = Vec::with_capacity(32);
        let mut chunk = [0u8; 64];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AcquisitionError::SourceTimeout(timeout));
            }
            self.port.set_timeout(remaining)?;
            let n = match self.port.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(AcquisitionError::SourceTimeout(timeout))
                }
                Err(e) => return Err(e.into()),
            };
            for &byte in &chunk[..n] {
                if byte == b'\r' || byte == b'\n' {
                    if !line.is_empty() {
                        return Ok(String::from_utf8_lossy(&line).trim().to_owned());
                    }
                } else {
                    line.push(byte);
                }
            }
        }
    }

    fn reset(&mut self) -> Result<(), AcquisitionError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AcquisitionError> {
        self.port.flush()?;
        Ok(())
    }
}

/// Single DC-voltage reading per `measure`, from a meter answering `"<number> <unit>"`.
pub struct SerialMultimeterSource<L: MeterLink> {
    link: L,
    command: String,
    label: String,
}

impl<L: MeterLink> SerialMultimeterSource<L> {
    pub fn new(link: L, command: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            link,
            command: command.into(),
            label: label.into(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: MeterLink> Source for SerialMultimeterSource<L> {
    fn measure(&mut self, timeout: Duration) -> Result<RawReading, AcquisitionError> {
        let response = self.link.query(&self.command, timeout)?;
        debug!("meter answered {response:?}");
        parse_meter_response(&response)
    }

    fn describe(&self) -> String {
        format!("serial multimeter on {}", self.label)
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.link.reset()?;
        self.link.flush()
    }
}

/// Parses responses like `"0.0123 V"`, `"-1.5E-3 VDC"`, `"12.0mV"` into volts.
///
/// `"0.0 V"` is a genuine zero reading. A response without a number (e.g. overload `"OL"`)
/// is malformed.
pub fn parse_meter_response(text: &str) -> Result<RawReading, AcquisitionError> {
    let malformed = || AcquisitionError::MalformedResponse(text.to_owned());
    let mut tokens = text.split_whitespace().map(|t| t.trim_matches(','));
    let (value, mut unit) = loop {
        let token = tokens.next().ok_or_else(malformed)?;
        let split = token
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
            .unwrap_or(token.len());
        let (number, suffix) = token.split_at(split);
        if let Ok(value) = number.parse::<f64>() {
            if value.is_finite() {
                break (value, suffix.to_owned());
            }
        }
    };
    if unit.is_empty() {
        unit = tokens.next().unwrap_or("V").to_owned();
    }
    match unit.to_ascii_lowercase().as_str() {
        "v" | "vdc" => Ok(RawReading::volts(value)),
        "mv" | "mvdc" => Ok(RawReading::volts(value * 1e-3)),
        "count" | "counts" => Ok(RawReading {
            value,
            unit: ReadingUnit::Count,
            channels: Vec::new(),
        }),
        _ => Err(malformed()),
    }
}
