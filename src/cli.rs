// src/cli.rs
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{PipelineConfig, SourceConfig};
use crate::types::ScrollTarget;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("expected a value after {0}")]
    MissingValue(String),
    #[error("{flag}: {reason}")]
    BadValue { flag: String, reason: String },
    #[error("unknown flag '{0}', try --help")]
    UnknownFlag(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunOptions),
    Help,
    Version,
}

/// Flags for a run; `None` leaves the config file (or default) value in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub simulate: bool,
    pub log_dir: Option<PathBuf>,
    pub no_metrics: bool,
    pub run_for_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self, CliError> {
        let mut opts = RunOptions::default();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "-h" | "--help" => return Ok(Command::Help),
                "-V" | "--version" => return Ok(Command::Version),
                "--config" => opts.config = Some(take_value(flag, &mut iter)?.into()),
                "--port" => opts.port = Some(take_value(flag, &mut iter)?),
                "--baud" => opts.baud = Some(parse_number(flag, &mut iter)?),
                "--simulate" => opts.simulate = true,
                "--log-dir" => opts.log_dir = Some(take_value(flag, &mut iter)?.into()),
                "--no-metrics" => opts.no_metrics = true,
                "--run-for" => opts.run_for_secs = Some(parse_number(flag, &mut iter)?),
                "--log-level" => {
                    let level = take_value(flag, &mut iter)?;
                    if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
                        return Err(CliError::BadValue {
                            flag: flag.clone(),
                            reason: format!("unknown level '{level}'"),
                        });
                    }
                    opts.log_level = Some(level);
                }
                other => return Err(CliError::UnknownFlag(other.to_owned())),
            }
        }
        Ok(Command::Run(opts))
    }

    pub fn help() -> String {
        concat!(
            "vacuum-telemetry - gauge logger with metrics push and live view\n",
            "\n",
            "USAGE:\n",
            "  vacuum-telemetry [--config <path>] [--port <name>] [--simulate] [--run-for <secs>]\n",
            "\n",
            "OPTIONS:\n",
            "  --config <path>     JSON pipeline config (defaults apply when omitted)\n",
            "  --port <name>       Serial meter port (default: /dev/ttyUSB0)\n",
            "  --baud <number>     Serial baud rate (default: 115200)\n",
            "  --simulate          Use the simulated analog scan instead of hardware\n",
            "  --log-dir <path>    Directory for the timestamped CSV log\n",
            "  --no-metrics        Do not push to the Pushgateway\n",
            "  --run-for <secs>    Stop after this many seconds\n",
            "  --log-level <error|warn|info|debug|trace>  Log verbosity (default: info)\n",
            "  -h, --help          Show this help\n",
            "  -V, --version       Show version\n",
            "\n",
            "While running, type on stdin:\n",
            "  scroll <percent>    Hold the view at that point of the recorded history\n",
            "  follow              Follow the newest sample again\n",
            "  quit                Stop\n",
        )
        .to_owned()
    }
}

impl RunOptions {
    /// Applies the flags on top of a loaded config.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if self.simulate {
            config.source = SourceConfig::simulated();
        }
        if let SourceConfig::Serial { port, baud, .. } = &mut config.source {
            if let Some(p) = &self.port {
                *port = p.clone();
            }
            if let Some(b) = self.baud {
                *baud = b;
            }
        }
        if let (Some(dir), Some(log)) = (&self.log_dir, config.durable_log.as_mut()) {
            log.directory = dir.clone();
            log.path = None;
        }
        if self.no_metrics {
            config.metrics = None;
        }
        if self.run_for_secs.is_some() {
            config.run_for_secs = self.run_for_secs;
        }
    }
}

/// A line typed while the pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Scroll(ScrollTarget),
    Follow,
    Quit,
}

impl Interaction {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match (words.next()?, words.next()) {
            ("scroll", Some(pct)) => {
                let pct: f64 = pct.trim_end_matches('%').parse().ok()?;
                Some(Interaction::Scroll(ScrollTarget::Fraction(
                    (pct / 100.0).clamp(0.0, 1.0),
                )))
            }
            ("follow", None) => Some(Interaction::Follow),
            ("quit" | "exit", None) => Some(Interaction::Quit),
            _ => None,
        }
    }
}

fn take_value(flag: &str, iter: &mut std::slice::Iter<String>) -> Result<String, CliError> {
    iter.next()
        .cloned()
        .ok_or_else(|| CliError::MissingValue(flag.to_owned()))
}

fn parse_number<T: std::str::FromStr>(
    flag: &str,
    iter: &mut std::slice::Iter<String>,
) -> Result<T, CliError> {
    let raw = take_value(flag, iter)?;
    raw.parse().map_err(|_| CliError::BadValue {
        flag: flag.to_owned(),
        reason: format!("'{raw}' is not a positive integer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_args_is_a_default_run() {
        assert_eq!(Command::parse(&[]), Ok(Command::Run(RunOptions::default())));
    }

    #[test]
    fn parses_run_flags() {
        let cmd = Command::parse(&args(&[
            "--port", "COM4", "--baud", "9600", "--no-metrics", "--run-for", "30", "--log-dir",
            "logs",
        ]))
        .unwrap();
        let Command::Run(opts) = cmd else {
            panic!("expected run");
        };
        assert_eq!(opts.port.as_deref(), Some("COM4"));
        assert_eq!(opts.baud, Some(9600));
        assert!(opts.no_metrics);
        assert_eq!(opts.run_for_secs, Some(30));
        assert_eq!(opts.log_dir, Some(PathBuf::from("logs")));
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert_eq!(Command::parse(&args(&["--port", "x", "-h"])), Ok(Command::Help));
        assert_eq!(Command::parse(&args(&["--version"])), Ok(Command::Version));
        assert!(Command::help().contains("--simulate"));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            Command::parse(&args(&["--baud"])),
            Err(CliError::MissingValue("--baud".into()))
        );
        assert!(matches!(
            Command::parse(&args(&["--baud", "fast"])),
            Err(CliError::BadValue { .. })
        ));
        assert!(matches!(
            Command::parse(&args(&["--log-level", "loud"])),
            Err(CliError::BadValue { .. })
        ));
        assert_eq!(
            Command::parse(&args(&["--frobnicate"])),
            Err(CliError::UnknownFlag("--frobnicate".into()))
        );
    }

    #[test]
    fn flags_override_config() {
        let mut config = PipelineConfig::default();
        let opts = RunOptions {
            port: Some("/dev/ttyACM1".into()),
            baud: Some(9600),
            no_metrics: true,
            log_dir: Some("runs".into()),
            run_for_secs: Some(5),
            ..RunOptions::default()
        };
        opts.apply(&mut config);
        assert_eq!(
            config.source,
            SourceConfig::Serial {
                port: "/dev/ttyACM1".into(),
                baud: 9600,
                command: "QM".into(),
            }
        );
        assert!(config.metrics.is_none());
        assert_eq!(config.durable_log.unwrap().directory, PathBuf::from("runs"));
        assert_eq!(config.run_for_secs, Some(5));
    }

    #[test]
    fn simulate_switches_to_analog_scan() {
        let mut config = PipelineConfig::default();
        RunOptions {
            simulate: true,
            ..RunOptions::default()
        }
        .apply(&mut config);
        assert!(matches!(config.source, SourceConfig::AnalogScan { .. }));
    }

    #[test]
    fn parses_interactions() {
        assert_eq!(
            Interaction::parse("scroll 25"),
            Some(Interaction::Scroll(ScrollTarget::Fraction(0.25)))
        );
        assert_eq!(
            Interaction::parse("scroll 150%"),
            Some(Interaction::Scroll(ScrollTarget::Fraction(1.0)))
        );
        assert_eq!(Interaction::parse("  follow "), Some(Interaction::Follow));
        assert_eq!(Interaction::parse("quit"), Some(Interaction::Quit));
        assert_eq!(Interaction::parse("scroll"), None);
        assert_eq!(Interaction::parse(""), None);
    }
}
