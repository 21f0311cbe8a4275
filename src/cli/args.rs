//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;

use pcapstitch_core::config::{ConfigError, Properties, KEY_LOG_LEVEL};
use pcapstitch_core::StreamConfig;

use super::OutputFormat;

/// Reassemble TCP streams from a capture, decrypting TLS with server keys.
#[derive(Parser, Debug)]
#[command(name = "pcapstitch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file (pcap or pcapng, Ethernet)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Properties file (ssl_port, ssl_rsa_private_key, cache_time, roundtrip, log_level)
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Server port whose traffic is treated as TLS
    #[arg(long = "tls-port", value_name = "PORT")]
    pub tls_port: Option<u16>,

    /// RSA private key (.key) or `<server-ip> <key-path>` mapping file
    #[arg(short = 'k', long = "key", value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Evict connections idle for this long (capture time)
    #[arg(long = "idle-timeout", value_name = "SECONDS")]
    pub idle_timeout: Option<f64>,

    /// Stream framing on output
    #[arg(long = "format", value_enum, default_value = "raw")]
    pub format: OutputFormat,

    /// Write streams to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "OUTPUT_FILE")]
    pub output: Option<PathBuf>,

    /// Write push-to-FIN round trips to this file
    #[arg(long = "round-trips", value_name = "RTT_FILE")]
    pub round_trips: Option<PathBuf>,

    /// Override a property (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Properties from the config file with `--set` overrides applied.
    pub fn properties(&self) -> Result<Properties, ConfigError> {
        let mut props = match &self.config {
            Some(path) => Properties::from_file(path)?,
            None => Properties::new(),
        };
        for assignment in &self.overrides {
            props.apply_override(assignment)?;
        }
        Ok(props)
    }

    /// Stream configuration: properties first, then explicit flags.
    pub fn stream_config(&self, props: &Properties) -> Result<StreamConfig, ConfigError> {
        let mut config = StreamConfig::from_properties(props)?;
        if let Some(port) = self.tls_port {
            config.tls_port = port;
        }
        if let Some(key) = &self.key {
            config.private_key_path = Some(key.clone());
        }
        if let Some(seconds) = self.idle_timeout {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: "idle-timeout".to_string(),
                    value: seconds.to_string(),
                });
            }
            config.idle_timeout_us = (seconds * 1_000_000.0) as i64;
        }
        if self.round_trips.is_some() {
            config.track_round_trips = true;
        }
        Ok(config)
    }

    /// Log filter directive: `-v` wins over the `log_level` property.
    pub fn log_filter(&self, props: &Properties) -> String {
        match self.verbose {
            0 => props.get_or(KEY_LOG_LEVEL, "warn").to_lowercase(),
            1 => "info".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}
