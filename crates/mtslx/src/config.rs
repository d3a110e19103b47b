use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capture::LiveOptions;
use crate::engine::{EngineConfig, RunLimits};
use crate::output::{OutputFormat, RecordFilter};
use crate::reassembly::ReassemblyConfig;
use crate::Cli;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("either --read or --iface must be given")]
    NoInput,
    #[error("--read and --iface cannot be used together")]
    ConflictingInputs,
    #[error("no output format selected (enable --json, --ndjson, --csv or --tsv)")]
    NoOutputFormat,
    #[error("separator must not be empty")]
    EmptySeparator,
    #[error("snap length must be positive, got {0}")]
    InvalidSnaplen(i32),
    #[error("{what} must be greater than zero")]
    Zero { what: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    File(PathBuf),
    Interface(LiveOptions),
}

impl Input {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Interface(_))
    }
}

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: Input,
    pub format: OutputFormat,
    pub filter: RecordFilter,
    pub engine: EngineConfig,
    pub limits: RunLimits,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let input = match (&cli.read, &cli.iface) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingInputs),
            (Some(path), None) => Input::File(path.clone()),
            (None, Some(iface)) => {
                if cli.snaplen <= 0 {
                    return Err(ConfigError::InvalidSnaplen(cli.snaplen));
                }
                Input::Interface(LiveOptions {
                    interface: iface.clone(),
                    snaplen: cli.snaplen,
                    promisc: cli.promisc,
                    read_timeout: cli.timeout.0,
                    bpf_filter: cli.bpf.clone(),
                })
            }
            (None, None) => return Err(ConfigError::NoInput),
        };

        let format = resolve_format(cli, input.is_live())?;
        let filter = RecordFilter {
            include_server: cli.ja3s,
            server_only: cli.ja3s_only,
        };

        if cli.max_session_bytes == 0 {
            return Err(ConfigError::Zero {
                what: "--max-session-bytes",
            });
        }
        if cli.max_sessions == 0 {
            return Err(ConfigError::Zero {
                what: "--max-sessions",
            });
        }
        if cli.count == Some(0) {
            return Err(ConfigError::Zero { what: "--count" });
        }

        let engine = EngineConfig {
            reassembly: ReassemblyConfig {
                max_session_bytes: cli.max_session_bytes,
                max_sessions: cli.max_sessions,
                idle_timeout: cli.idle_timeout,
                ..ReassemblyConfig::default()
            },
            ..EngineConfig::default()
        };

        Ok(Self {
            input,
            format,
            filter,
            engine,
            limits: RunLimits {
                max_frames: cli.count,
                duration: cli.duration,
            },
        })
    }
}

/// Tab beats comma beats JSON lines beats the JSON array. Live capture
/// streams, so JSON there is always one object per line, and live capture
/// with JSON switched off falls back to comma separated rows.
fn resolve_format(cli: &Cli, live: bool) -> Result<OutputFormat, ConfigError> {
    if cli.tsv {
        return Ok(OutputFormat::Delimited {
            separator: "\t".to_string(),
        });
    }
    if cli.csv || (live && !cli.json && !cli.ndjson) {
        if cli.separator.is_empty() {
            return Err(ConfigError::EmptySeparator);
        }
        return Ok(OutputFormat::Delimited {
            separator: cli.separator.clone(),
        });
    }
    if cli.ndjson || (live && cli.json) {
        return Ok(OutputFormat::JsonLines);
    }
    if cli.json {
        return Ok(OutputFormat::JsonArray);
    }
    Err(ConfigError::NoOutputFormat)
}

/// Read timeout for live capture; `None` blocks indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimeout(pub Option<Duration>);

/// Parses `forever`, `0` or a negative value as "block", else a duration.
pub fn parse_timeout(s: &str) -> Result<ReadTimeout, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("forever") || s.starts_with('-') {
        return Ok(ReadTimeout(None));
    }
    let d = parse_duration_allow_zero(s)?;
    Ok(ReadTimeout((!d.is_zero()).then_some(d)))
}

/// Parses durations like `250ms`, `30s`, `5m`, `1h` or a bare number of
/// seconds. Zero is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let d = parse_duration_allow_zero(s.trim())?;
    if d.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(d)
}

fn parse_duration_allow_zero(s: &str) -> Result<Duration, String> {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let d = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "us" => Duration::from_micros(value),
        "ns" => Duration::from_nanos(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(format!("unknown duration unit '{}' in '{}'", unit, s)),
    };
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(args: &[&str]) -> Result<Config, ConfigError> {
        let cli = Cli::try_parse_from(std::iter::once("mtslx").chain(args.iter().copied())).unwrap();
        Config::from_cli(&cli)
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn timeouts() {
        assert_eq!(parse_timeout("forever"), Ok(ReadTimeout(None)));
        assert_eq!(parse_timeout("0"), Ok(ReadTimeout(None)));
        assert_eq!(parse_timeout("-1ns"), Ok(ReadTimeout(None)));
        assert_eq!(
            parse_timeout("100ms"),
            Ok(ReadTimeout(Some(Duration::from_millis(100))))
        );
    }

    #[test]
    fn file_defaults() {
        let cfg = config(&["--read", "trace.pcap"]).unwrap();
        assert_eq!(cfg.input, Input::File(PathBuf::from("trace.pcap")));
        assert_eq!(cfg.format, OutputFormat::JsonArray);
        assert_eq!(cfg.filter, RecordFilter::default());
        assert_eq!(cfg.engine.reassembly.max_session_bytes, 65536);
        assert_eq!(cfg.engine.reassembly.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.limits.max_frames, None);
    }

    #[test]
    fn live_defaults() {
        let cfg = config(&["--iface", "eth0"]).unwrap();
        let Input::Interface(opts) = &cfg.input else {
            panic!("expected live input");
        };
        assert_eq!(opts.interface, "eth0");
        assert_eq!(opts.snaplen, 1514);
        assert!(opts.promisc);
        assert_eq!(opts.read_timeout, None);
        assert_eq!(opts.bpf_filter, "tcp");
        assert_eq!(cfg.format, OutputFormat::JsonLines);
    }

    #[test]
    fn format_precedence() {
        let tsv = config(&["-r", "a.pcap", "--csv", "--tsv"]).unwrap();
        assert_eq!(tsv.format, OutputFormat::Delimited { separator: "\t".into() });

        let csv = config(&["-r", "a.pcap", "--csv", "--separator", ";", "--ndjson"]).unwrap();
        assert_eq!(csv.format, OutputFormat::Delimited { separator: ";".into() });

        let ndjson = config(&["-r", "a.pcap", "--ndjson"]).unwrap();
        assert_eq!(ndjson.format, OutputFormat::JsonLines);

        let none = config(&["-r", "a.pcap", "--json=false"]);
        assert_eq!(none.err(), Some(ConfigError::NoOutputFormat));

        let live_rows = config(&["-i", "eth0", "--json=false"]).unwrap();
        assert_eq!(live_rows.format, OutputFormat::Delimited { separator: ",".into() });
    }

    #[test]
    fn role_filters() {
        let cfg = config(&["-r", "a.pcap", "--ja3s=false"]).unwrap();
        assert!(!cfg.filter.include_server);

        let cfg = config(&["-r", "a.pcap", "--ja3s-only"]).unwrap();
        assert!(cfg.filter.server_only);
    }

    #[test]
    fn invalid_combinations() {
        assert_eq!(config(&[]).err(), Some(ConfigError::NoInput));
        assert_eq!(
            config(&["-r", "a.pcap", "-i", "eth0"]).err(),
            Some(ConfigError::ConflictingInputs)
        );
        assert_eq!(
            config(&["-r", "a.pcap", "--csv", "--separator", ""]).err(),
            Some(ConfigError::EmptySeparator)
        );
        assert_eq!(
            config(&["-i", "eth0", "--snaplen", "0"]).err(),
            Some(ConfigError::InvalidSnaplen(0))
        );
        assert!(config(&["-r", "a.pcap", "--count", "0"]).is_err());
    }

    #[test]
    fn limits_and_session_settings() {
        let cfg = config(&[
            "-i",
            "eth0",
            "--count",
            "10",
            "--duration",
            "1m",
            "--idle-timeout",
            "5s",
            "--max-session-bytes",
            "4096",
            "--timeout",
            "250ms",
        ])
        .unwrap();
        assert_eq!(cfg.limits.max_frames, Some(10));
        assert_eq!(cfg.limits.duration, Some(Duration::from_secs(60)));
        assert_eq!(cfg.engine.reassembly.idle_timeout, Duration::from_secs(5));
        assert_eq!(cfg.engine.reassembly.max_session_bytes, 4096);
        let Input::Interface(opts) = &cfg.input else {
            panic!("expected live input");
        };
        assert_eq!(opts.read_timeout, Some(Duration::from_millis(250)));
    }
}
