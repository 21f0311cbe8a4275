//! RSA private key store.
//!
//! Keys are configured either as a single PEM file (registered for every
//! server) or as a mapping file of `<server-ip> <key-file-path>` lines:
//!
//! ```text
//! # server address -> key
//! 10.0.0.2  /etc/stitch/keys/www.key
//! *         default.key
//! ```
//!
//! Relative key paths in a mapping file are resolved against the mapping
//! file's directory. The store is read-only once built and can be shared
//! between threads without locking.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey};
use thiserror::Error;

use super::der::{self, DerError};

/// Wildcard selector matching every server address.
pub const WILDCARD: &str = "*";

/// Errors that can occur when loading private keys.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// I/O error reading a key or mapping file
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No usable PEM block
    #[error("Invalid PEM: {0}")]
    Pem(String),

    /// Password-protected keys cannot be used
    #[error("Encrypted private keys are not supported")]
    EncryptedKey,

    #[error("Invalid base64 in PEM body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Malformed key structure: {0}")]
    Der(#[from] DerError),

    #[error("Invalid RSA key: {0}")]
    InvalidKey(#[from] rsa::Error),

    /// Invalid mapping line
    #[error("Invalid mapping at line {line}: {message}")]
    InvalidMapping { line: usize, message: String },
}

/// Server address selector in a mapping file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySelector {
    Address(IpAddr),
    Wildcard,
}

impl KeySelector {
    fn parse(s: &str) -> Option<Self> {
        if s == WILDCARD {
            return Some(KeySelector::Wildcard);
        }
        s.parse().ok().map(KeySelector::Address)
    }
}

/// Immutable map from server address (or wildcard) to RSA private key.
#[derive(Debug, Clone, Default)]
pub struct PrivateKeyStore {
    keys: HashMap<IpAddr, RsaPrivateKey>,
    wildcard: Option<RsaPrivateKey>,
}

impl PrivateKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding one key for every server.
    pub fn with_wildcard(key: RsaPrivateKey) -> Self {
        Self {
            keys: HashMap::new(),
            wildcard: Some(key),
        }
    }

    /// Load keys from a path: a `.key` file is a single key for every server,
    /// anything else is read as a mapping file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, KeyStoreError> {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "key") {
            Ok(Self::with_wildcard(load_key_file(path)?))
        } else {
            Self::from_mapping_file(path)
        }
    }

    /// Load a mapping file.
    pub fn from_mapping_file<P: AsRef<Path>>(path: P) -> Result<Self, KeyStoreError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_reader(file, base)
    }

    /// Parse mapping lines from any reader, resolving relative key paths
    /// against `base_dir`.
    pub fn from_reader<R: Read>(reader: R, base_dir: &Path) -> Result<Self, KeyStoreError> {
        let reader = BufReader::new(reader);
        let mut store = Self::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result.map_err(|source| KeyStoreError::Io {
                path: base_dir.to_path_buf(),
                source,
            })?;
            let line_num = line_num + 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (selector, key_path) =
                line.split_once(char::is_whitespace)
                    .ok_or_else(|| KeyStoreError::InvalidMapping {
                        line: line_num,
                        message: "expected '<server-ip> <key-file-path>'".to_string(),
                    })?;
            let selector =
                KeySelector::parse(selector).ok_or_else(|| KeyStoreError::InvalidMapping {
                    line: line_num,
                    message: format!("invalid server address '{selector}'"),
                })?;

            let key_path = Path::new(key_path.trim());
            let key_path = if key_path.is_relative() {
                base_dir.join(key_path)
            } else {
                key_path.to_path_buf()
            };
            store.insert(selector, load_key_file(&key_path)?);
        }

        Ok(store)
    }

    /// Register a key.
    pub fn insert(&mut self, selector: KeySelector, key: RsaPrivateKey) {
        match selector {
            KeySelector::Address(ip) => {
                self.keys.insert(ip, key);
            }
            KeySelector::Wildcard => self.wildcard = Some(key),
        }
    }

    /// Key for a server: exact address first, then the wildcard.
    pub fn lookup(&self, server: &IpAddr) -> Option<&RsaPrivateKey> {
        self.keys.get(server).or(self.wildcard.as_ref())
    }

    /// Whether any key could decrypt traffic to this server.
    pub fn has_key_for(&self, server: &IpAddr) -> bool {
        self.lookup(server).is_some()
    }

    /// Number of keys held, the wildcard included.
    pub fn len(&self) -> usize {
        self.keys.len() + usize::from(self.wildcard.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decrypt an RSA PKCS#1 v1.5 encrypted pre-master secret.
pub fn decrypt_pre_master(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, rsa::Error> {
    key.decrypt(Pkcs1v15Encrypt, ciphertext)
}

/// Big-endian modulus bytes of a key.
pub fn modulus_bytes(key: &RsaPrivateKey) -> Vec<u8> {
    key.n().to_bytes_be()
}

/// Load one PEM private key file.
pub fn load_key_file(path: &Path) -> Result<RsaPrivateKey, KeyStoreError> {
    let pem = std::fs::read_to_string(path).map_err(|source| KeyStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pem(&pem)
}

/// Parse a PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM block.
pub fn parse_pem(pem: &str) -> Result<RsaPrivateKey, KeyStoreError> {
    let (label, body) = decode_pem(pem)?;
    match label.as_str() {
        "RSA PRIVATE KEY" => parse_pkcs1_der(&body),
        "PRIVATE KEY" => parse_pkcs1_der(der::unwrap_pkcs8(&body)?),
        "ENCRYPTED PRIVATE KEY" => Err(KeyStoreError::EncryptedKey),
        other => Err(KeyStoreError::Pem(format!("unexpected block '{other}'"))),
    }
}

/// Build a key from a DER `RSAPrivateKey` structure.
pub fn parse_pkcs1_der(bytes: &[u8]) -> Result<RsaPrivateKey, KeyStoreError> {
    let parts = der::parse_rsa_private_key(bytes)?;
    let key = RsaPrivateKey::from_components(
        BigUint::from_bytes_be(parts.modulus),
        BigUint::from_bytes_be(parts.public_exponent),
        BigUint::from_bytes_be(parts.private_exponent),
        vec![
            BigUint::from_bytes_be(parts.prime1),
            BigUint::from_bytes_be(parts.prime2),
        ],
    )?;
    Ok(key)
}

/// Return the label and decoded body of the first PEM block.
pub fn decode_pem(pem: &str) -> Result<(String, Vec<u8>), KeyStoreError> {
    let mut lines = pem.lines().map(str::trim);

    let label = lines
        .by_ref()
        .find_map(|line| {
            line.strip_prefix("-----BEGIN ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or_else(|| KeyStoreError::Pem("no BEGIN line".to_string()))?
        .to_string();

    let mut body = String::new();
    let mut terminated = false;
    for line in lines {
        if line.starts_with("-----END ") {
            terminated = true;
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            // Legacy OpenSSL encryption headers
            if name.trim() == "Proc-Type" && value.contains("ENCRYPTED") {
                return Err(KeyStoreError::EncryptedKey);
            }
            continue;
        }
        body.push_str(line);
    }

    if !terminated {
        return Err(KeyStoreError::Pem(format!("missing END line for '{label}'")));
    }

    let der = STANDARD.decode(body.as_bytes())?;
    Ok((label, der))
}
