//! Properties-file configuration.
//!
//! Settings come from a `key=value` properties file, optionally overridden
//! from the command line, and are turned into a [`StreamConfig`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::stream::StreamConfig;

/// TLS service port.
pub const KEY_SSL_PORT: &str = "ssl_port";
/// Private key file or server-to-key mapping file.
pub const KEY_SSL_RSA_PRIVATE_KEY: &str = "ssl_rsa_private_key";
/// Idle timeout in seconds.
pub const KEY_CACHE_TIME: &str = "cache_time";
/// Report push-to-FIN round trips.
pub const KEY_ROUNDTRIP: &str = "roundtrip";
pub const KEY_LOG_LEVEL: &str = "log_level";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line without a key/value separator
    #[error("Invalid property at line {line}: {content}")]
    InvalidLine { line: usize, content: String },

    /// Value that does not parse as the expected type
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// Command line override without `=`
    #[error("Invalid override (expected key=value): {0}")]
    InvalidOverride(String),
}

/// Ordered `key=value` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load properties from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse properties from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::from_reader(content.as_bytes())
    }

    /// Parse properties from any reader.
    ///
    /// Blank lines and lines starting with `#` or `!` are skipped. Keys and
    /// values are separated by the first `=` or `:` and trimmed.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let reader = BufReader::new(reader);
        let mut props = Self::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let (key, value) = split_property(line).ok_or_else(|| ConfigError::InvalidLine {
                line: line_num + 1,
                content: line.to_string(),
            })?;
            props.set(key, value);
        }

        Ok(props)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    /// Apply a `key=value` override such as `--ssl_port=8443`.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidOverride(assignment.to_string()))?;
        let key = key.trim().trim_start_matches('-');
        if key.is_empty() {
            return Err(ConfigError::InvalidOverride(assignment.to_string()));
        }
        self.set(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse a value, `None` when the key is absent.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Boolean value (`true`/`yes`/`on`/`1`), `default` when absent.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: v.to_string(),
                }),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn split_property(line: &str) -> Option<(&str, &str)> {
    let at = line.find(['=', ':'])?;
    let key = line[..at].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, &line[at + 1..]))
}

impl StreamConfig {
    /// Build a configuration from properties, keeping defaults for absent keys.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let mut config = StreamConfig::default();
        if let Some(port) = props.get_parsed::<u16>(KEY_SSL_PORT)? {
            config.tls_port = port;
        }
        if let Some(path) = props.get(KEY_SSL_RSA_PRIVATE_KEY).filter(|p| !p.is_empty()) {
            config.private_key_path = Some(PathBuf::from(path));
        }
        if let Some(seconds) = props.get_parsed::<f64>(KEY_CACHE_TIME)? {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: KEY_CACHE_TIME.to_string(),
                    value: seconds.to_string(),
                });
            }
            config.idle_timeout_us = (seconds * 1_000_000.0) as i64;
        }
        config.track_round_trips = props.get_bool(KEY_ROUNDTRIP, false)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Test 1: Comments, blank lines and both separators
    #[test]
    fn test_parse_properties() {
        let props = Properties::parse(
            "# capture settings\n\
             ! legacy comment\n\
             \n\
             ssl_port = 8443\n\
             log_level: debug\n\
             ssl_rsa_private_key=/etc/keys/map.txt\n",
        )
        .unwrap();

        assert_eq!(props.len(), 3);
        assert_eq!(props.get(KEY_SSL_PORT), Some("8443"));
        assert_eq!(props.get(KEY_LOG_LEVEL), Some("debug"));
        assert_eq!(props.get_or("missing", "fallback"), "fallback");
    }

    // Test 2: Line without separator is an error with its line number
    #[test]
    fn test_invalid_line() {
        let err = Properties::parse("ssl_port=443\nnot a property\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine { line: 2, .. }));
    }

    // Test 3: StreamConfig from properties
    #[test]
    fn test_stream_config_from_properties() {
        let props = Properties::parse(
            "ssl_port=8443\ncache_time=2.5\nssl_rsa_private_key=server.key\nroundtrip=on\n",
        )
        .unwrap();
        let config = StreamConfig::from_properties(&props).unwrap();
        assert_eq!(config.tls_port, 8443);
        assert_eq!(config.idle_timeout_us, 2_500_000);
        assert_eq!(config.private_key_path, Some(PathBuf::from("server.key")));
        assert!(config.track_round_trips);
    }

    // Test 4: Defaults when keys are absent
    #[test]
    fn test_stream_config_defaults() {
        let config = StreamConfig::from_properties(&Properties::new()).unwrap();
        assert_eq!(config.tls_port, 443);
        assert_eq!(config.idle_timeout_us, 1_000_000);
        assert!(config.private_key_path.is_none());
        assert!(!config.track_round_trips);
    }

    // Test 5: Bad numbers are reported with their key
    #[test]
    fn test_invalid_port() {
        let props = Properties::parse("ssl_port=https\n").unwrap();
        let err = StreamConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ssl_port"));
    }

    // Test 6: Command line overrides
    #[test]
    fn test_apply_override() {
        let mut props = Properties::parse("ssl_port=443\n").unwrap();
        props.apply_override("--ssl_port=9443").unwrap();
        props.apply_override("log_level=trace").unwrap();
        assert_eq!(props.get(KEY_SSL_PORT), Some("9443"));
        assert_eq!(props.get(KEY_LOG_LEVEL), Some("trace"));
        assert!(props.apply_override("ssl_port").is_err());
        assert!(props.apply_override("=1").is_err());
    }

    // Test 7: Booleans
    #[test]
    fn test_get_bool() {
        let props = Properties::parse("a=yes\nb=0\nc=maybe\n").unwrap();
        assert!(props.get_bool("a", false).unwrap());
        assert!(!props.get_bool("b", true).unwrap());
        assert!(props.get_bool("c", true).is_err());
        assert!(props.get_bool("d", true).unwrap());
    }

    // Test 8: Load from file
    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_time=30").unwrap();
        let props = Properties::from_file(file.path()).unwrap();
        let config = StreamConfig::from_properties(&props).unwrap();
        assert_eq!(config.idle_timeout_us, 30_000_000);
    }
}
