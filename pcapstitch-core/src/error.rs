//! Error types for pcapstitch-core.
//!
//! Errors that can cross the crate boundary are collected here:
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`PcapError`] - Errors from capture file reading
//!
//! Module-level errors ([`ConfigError`](crate::config::ConfigError),
//! [`KeyStoreError`](crate::tls::KeyStoreError)) convert into [`enum@Error`].
//! Errors raised while processing a single packet never surface here; they are
//! logged and the packet is skipped.

use thiserror::Error;

use crate::config::ConfigError;
use crate::tls::KeyStoreError;

/// Main error type for pcapstitch-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing a capture file
    #[error("PCAP error: {0}")]
    Pcap(#[from] PcapError),

    /// Error loading configuration properties
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error loading RSA private keys
    #[error("Private key error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid capture format
    #[error("Invalid PCAP format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u16 },
}

/// Result alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Pcap(PcapError::UnsupportedLinkType { link_type: 113 });
        assert_eq!(err.to_string(), "PCAP error: Unsupported link type: 113");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
