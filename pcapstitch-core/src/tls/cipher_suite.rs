//! Cipher suite registry.
//!
//! Only RSA key exchange suites are listed: the pre-master secret of every
//! other key exchange cannot be recovered from a static server key.

use thiserror::Error;

/// Errors from cipher suite lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherSuiteError {
    #[error("Unsupported cipher suite: 0x{0:04x}")]
    Unsupported(u16),
}

/// Symmetric transform used for record protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Rc4,
    TripleDesEde,
    Aes128,
    Aes256,
    Camellia128,
    Camellia256,
}

impl BulkCipher {
    /// Whether the transform is a CBC block cipher.
    pub fn is_block(&self) -> bool {
        !matches!(self, BulkCipher::Rc4)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BulkCipher::Rc4 => "RC4",
            BulkCipher::TripleDesEde => "DESede/CBC",
            BulkCipher::Aes128 | BulkCipher::Aes256 => "AES/CBC",
            BulkCipher::Camellia128 | BulkCipher::Camellia256 => "Camellia/CBC",
        }
    }
}

/// Parameters of one cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub bulk: BulkCipher,
    /// Block size in bytes, 0 for stream ciphers.
    pub block_size: usize,
    pub mac_key_size: usize,
    pub write_key_size: usize,
}

impl CipherSuite {
    /// Size of the key block: MAC keys, write keys and IVs for both directions.
    pub fn key_block_len(&self) -> usize {
        2 * (self.mac_key_size + self.write_key_size + self.block_size)
    }

    /// IV length; equal to the block size.
    pub fn iv_len(&self) -> usize {
        self.block_size
    }
}

const fn suite(
    id: u16,
    name: &'static str,
    bulk: BulkCipher,
    block_size: usize,
    mac_key_size: usize,
    write_key_size: usize,
) -> CipherSuite {
    CipherSuite {
        id,
        name,
        bulk,
        block_size,
        mac_key_size,
        write_key_size,
    }
}

static SUITES: &[CipherSuite] = &[
    suite(0x0004, "TLS_RSA_WITH_RC4_128_MD5", BulkCipher::Rc4, 0, 16, 16),
    suite(0x0005, "TLS_RSA_WITH_RC4_128_SHA", BulkCipher::Rc4, 0, 20, 16),
    suite(0x000a, "TLS_RSA_WITH_3DES_EDE_CBC_SHA", BulkCipher::TripleDesEde, 8, 20, 24),
    suite(0x002f, "TLS_RSA_WITH_AES_128_CBC_SHA", BulkCipher::Aes128, 16, 20, 16),
    suite(0x0035, "TLS_RSA_WITH_AES_256_CBC_SHA", BulkCipher::Aes256, 16, 20, 32),
    suite(0x003c, "TLS_RSA_WITH_AES_128_CBC_SHA256", BulkCipher::Aes128, 16, 32, 16),
    suite(0x003d, "TLS_RSA_WITH_AES_256_CBC_SHA256", BulkCipher::Aes256, 16, 32, 32),
    suite(0x0041, "TLS_RSA_WITH_CAMELLIA_128_CBC_SHA", BulkCipher::Camellia128, 16, 20, 16),
    suite(0x0084, "TLS_RSA_WITH_CAMELLIA_256_CBC_SHA", BulkCipher::Camellia256, 16, 20, 32),
];

/// All registered suites.
pub fn all() -> &'static [CipherSuite] {
    SUITES
}

/// Look up a suite by its numeric identifier.
pub fn from_id(id: u16) -> Result<&'static CipherSuite, CipherSuiteError> {
    SUITES
        .iter()
        .find(|s| s.id == id)
        .ok_or(CipherSuiteError::Unsupported(id))
}

/// Look up a suite by the two identifier bytes as they appear on the wire.
///
/// Every registered suite has a leading zero byte; anything else is unsupported.
pub fn lookup(id: [u8; 2]) -> Result<&'static CipherSuite, CipherSuiteError> {
    if id[0] != 0x00 {
        return Err(CipherSuiteError::Unsupported(u16::from_be_bytes(id)));
    }
    lookup_byte(id[1])
}

/// Look up a suite by the trailing identifier byte alone.
pub fn lookup_byte(id: u8) -> Result<&'static CipherSuite, CipherSuiteError> {
    from_id(u16::from(id))
}
