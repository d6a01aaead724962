//! # Command-Line Interface Module
//!
//! Argument parsing shared by the `app-control-server` and
//! `app-control-client` binaries, plus the [`Config`] conversion that turns
//! parsed arguments into the typed values the rest of the crate consumes
//! (durations, port ranges).

use clap::{builder::styling::{AnsiColor, Styles}, Parser};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Shared command-line options for both the control server and the control
/// client. Fields that only make sense for one side (`remote_port`) are
/// simply ignored by the other.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Identity of the user this process runs on behalf of
    #[arg(long, help_heading = "Identity")]
    pub user: String,

    /// Name of the application/strategy this process belongs to
    #[arg(long, help_heading = "Identity")]
    pub application: String,

    /// Bind address (server) or remote address (client)
    #[arg(long, default_value = "0.0.0.0", help_heading = "Networking")]
    pub host: String,

    /// Remote control port (client only; the server always picks a free
    /// port out of `--server-port-range` and advertises it via discovery)
    #[arg(long, help_heading = "Networking")]
    pub remote_port: Option<u16>,

    /// Control server bind range, "START:END"
    #[arg(long, default_value = "8100:8500", value_parser = parse_port_range, help_heading = "Networking")]
    pub server_port_range: (u16, u16),

    /// Event publisher bind range, "START:END"
    #[arg(long, default_value = "7000:8000", value_parser = parse_port_range, help_heading = "Networking")]
    pub event_port_range: (u16, u16),

    /// Bytes per CHUNK data field during payload transfer
    #[arg(long, default_value_t = crate::defaults::CHUNK_SIZE, help_heading = "Protocol tuning")]
    pub chunk_size: usize,

    /// Max outstanding chunks before the sender must wait for CHUNK_OK
    #[arg(long, default_value_t = crate::defaults::WINDOW_SIZE, help_heading = "Protocol tuning")]
    pub window_size: usize,

    /// Discovery beacon emit interval
    #[arg(long, value_parser = parse_duration, default_value = "10s", help_heading = "Protocol tuning")]
    pub beacon_period: Duration,

    /// Discovery stale-entry threshold
    #[arg(long, value_parser = parse_duration, default_value = "40s", help_heading = "Protocol tuning")]
    pub age_out: Duration,

    /// Client handshake (INIT state) timeout
    #[arg(long, value_parser = parse_duration, default_value = "5s", help_heading = "Protocol tuning")]
    pub handshake_timeout: Duration,

    /// Server LOADING state timeout
    #[arg(long, value_parser = parse_duration, default_value = "60s", help_heading = "Protocol tuning")]
    pub load_timeout: Duration,

    /// Keep-alive interval
    #[arg(long, value_parser = parse_duration, default_value = "5s", help_heading = "Protocol tuning")]
    pub keepalive_period: Duration,

    /// Write detailed logs here instead of the default daily-rotated file
    /// ("stderr" sends them to stderr instead of a file)
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence the colorized stdout summary layer; only the detailed layer runs
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stdout/stderr.
    ///
    /// -v: debug, -vv: trace. By default only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

/// Internal, fully-typed configuration derived from [`Args`]. Kept distinct
/// from `Args` so components never depend on clap's attribute-decorated
/// struct directly.
#[derive(Clone, Debug)]
pub struct Config {
    pub user: String,
    pub application: String,
    pub host: String,
    pub remote_port: Option<u16>,
    pub server_port_range: RangeInclusive<u16>,
    pub event_port_range: RangeInclusive<u16>,
    pub chunk_size: usize,
    pub window_size: usize,
    pub beacon_period: Duration,
    pub age_out: Duration,
    pub handshake_timeout: Duration,
    pub load_timeout: Duration,
    pub keepalive_period: Duration,
    pub log_file: Option<PathBuf>,
    pub quiet: bool,
    pub verbose: u8,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            user: args.user.clone(),
            application: args.application.clone(),
            host: args.host.clone(),
            remote_port: args.remote_port,
            server_port_range: args.server_port_range.0..=args.server_port_range.1,
            event_port_range: args.event_port_range.0..=args.event_port_range.1,
            chunk_size: args.chunk_size,
            window_size: args.window_size,
            beacon_period: args.beacon_period,
            age_out: args.age_out,
            handshake_timeout: args.handshake_timeout,
            load_timeout: args.load_timeout,
            keepalive_period: args.keepalive_period,
            log_file: args.log_file.as_ref().map(PathBuf::from),
            quiet: args.quiet,
            verbose: args.verbose,
        }
    }
}

/// Parses "START:END" into an inclusive port range's bounds.
fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got {s}"))?;
    let start: u16 = start.parse().map_err(|_| format!("invalid start port: {start}"))?;
    let end: u16 = end.parse().map_err(|_| format!("invalid end port: {end}"))?;
    if start > end {
        return Err(format!("range start {start} is after end {end}"));
    }
    Ok((start, end))
}

/// Parse duration from string (e.g., "10s", "5m", "1h").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("invalid duration unit: {unit}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn parse_port_range_accepts_start_end() {
        assert_eq!(parse_port_range("7000:8000").unwrap(), (7000, 8000));
    }

    #[test]
    fn parse_port_range_rejects_inverted() {
        assert!(parse_port_range("8000:7000").is_err());
    }

    #[test]
    fn config_carries_identity_and_tuning_from_args() {
        let args = Args::try_parse_from([
            "app-control-server",
            "--user",
            "sysadmin",
            "--application",
            "strategy1",
        ])
        .unwrap();
        let config = Config::from(&args);
        assert_eq!(config.user, "sysadmin");
        assert_eq!(config.application, "strategy1");
        assert_eq!(config.server_port_range, 8100..=8500);
        assert_eq!(config.event_port_range, 7000..=8000);
        assert_eq!(config.chunk_size, crate::defaults::CHUNK_SIZE);
    }
}
