//! TLS key derivation functions.
//!
//! Implements:
//! - SSL 3.0 MD5/SHA1 key expansion
//! - TLS 1.0/1.1 PRF (split secret, P_MD5 XOR P_SHA1)
//! - TLS 1.2 PRF based on HMAC-SHA256
//!
//! and the master secret / key block derivations built on them.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

use super::cipher_suite::CipherSuite;

/// Length of a TLS master secret.
pub const MASTER_SECRET_LEN: usize = 48;

/// Errors during key derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyDerivationError {
    #[error("Unsupported protocol version 3.{0}")]
    UnsupportedVersion(u8),

    #[error("Invalid key material length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Protocol version, identified by the minor version byte (major is always 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
}

impl ProtocolVersion {
    pub fn from_minor(minor: u8) -> Result<Self, KeyDerivationError> {
        match minor {
            0 => Ok(ProtocolVersion::Ssl3),
            1 => Ok(ProtocolVersion::Tls10),
            2 => Ok(ProtocolVersion::Tls11),
            3 => Ok(ProtocolVersion::Tls12),
            other => Err(KeyDerivationError::UnsupportedVersion(other)),
        }
    }

    pub fn minor(&self) -> u8 {
        match self {
            ProtocolVersion::Ssl3 => 0,
            ProtocolVersion::Tls10 => 1,
            ProtocolVersion::Tls11 => 2,
            ProtocolVersion::Tls12 => 3,
        }
    }

    /// CBC records carry an explicit IV block from TLS 1.1 on.
    pub fn has_explicit_iv(&self) -> bool {
        *self >= ProtocolVersion::Tls11
    }

    /// The encrypted pre-master secret is length-prefixed from TLS 1.0 on.
    pub fn has_length_prefixed_exchange(&self) -> bool {
        *self >= ProtocolVersion::Tls10
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::Ssl3 => "SSLv3",
            ProtocolVersion::Tls10 => "TLSv1.0",
            ProtocolVersion::Tls11 => "TLSv1.1",
            ProtocolVersion::Tls12 => "TLSv1.2",
        }
    }
}

/// Key block split into its per-direction parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlock {
    pub client_write_mac_key: Vec<u8>,
    pub server_write_mac_key: Vec<u8>,
    pub client_write_key: Vec<u8>,
    pub server_write_key: Vec<u8>,
    /// Empty for stream ciphers
    pub client_write_iv: Vec<u8>,
    /// Empty for stream ciphers
    pub server_write_iv: Vec<u8>,
}

impl KeyBlock {
    /// Partition raw key material as
    /// `[client MAC][server MAC][client key][server key][client IV][server IV]`.
    pub fn partition(material: &[u8], suite: &CipherSuite) -> Result<Self, KeyDerivationError> {
        let expected = suite.key_block_len();
        if material.len() < expected {
            return Err(KeyDerivationError::InvalidKeyLength {
                expected,
                actual: material.len(),
            });
        }

        let mut rest = material;
        let mut take = |n: usize| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head.to_vec()
        };

        Ok(Self {
            client_write_mac_key: take(suite.mac_key_size),
            server_write_mac_key: take(suite.mac_key_size),
            client_write_key: take(suite.write_key_size),
            server_write_key: take(suite.write_key_size),
            client_write_iv: take(suite.iv_len()),
            server_write_iv: take(suite.iv_len()),
        })
    }
}

// ============================================================================
// SSL 3.0 Expansion
// ============================================================================

/// SSL 3.0 expansion.
///
/// Output = MD5(secret + SHA1("A" + secret + r1 + r2)) +
///          MD5(secret + SHA1("BB" + secret + r1 + r2)) + ...
pub fn ssl3_expand(
    secret: &[u8],
    rand1: &[u8],
    rand2: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, KeyDerivationError> {
    // Prefixes run from "A" to 26 x "Z"
    const MAX_ROUNDS: usize = 26;
    if output_len > MAX_ROUNDS * 16 {
        return Err(KeyDerivationError::DerivationFailed(format!(
            "SSL3 expansion limited to {} bytes, requested {}",
            MAX_ROUNDS * 16,
            output_len
        )));
    }

    let mut result = Vec::with_capacity(output_len + 16);
    let mut round = 0;
    while result.len() < output_len {
        let prefix = vec![b'A' + round as u8; round + 1];

        let mut sha = Sha1::new();
        sha.update(&prefix);
        sha.update(secret);
        sha.update(rand1);
        sha.update(rand2);
        let inner = sha.finalize();

        let mut md5 = Md5::new();
        md5.update(secret);
        md5.update(inner);
        result.extend_from_slice(&md5.finalize());
        round += 1;
    }

    result.truncate(output_len);
    Ok(result)
}

// ============================================================================
// TLS PRF Implementations
// ============================================================================

fn hmac_parts<M>(secret: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, KeyDerivationError>
where
    M: Mac + hmac::digest::KeyInit,
{
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(secret)
        .map_err(|e| KeyDerivationError::DerivationFailed(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// P_hash expansion function.
///
///   P_hash(secret, seed) = HMAC_hash(secret, A(1) + seed) +
///                          HMAC_hash(secret, A(2) + seed) + ...
///
/// With A(0) = seed, A(i) = HMAC_hash(secret, A(i-1))
fn p_hash<M>(secret: &[u8], seed: &[u8], output_len: usize) -> Result<Vec<u8>, KeyDerivationError>
where
    M: Mac + hmac::digest::KeyInit,
{
    let mut result = Vec::with_capacity(output_len);
    let mut a = hmac_parts::<M>(secret, &[seed])?;

    while result.len() < output_len {
        let block = hmac_parts::<M>(secret, &[&a, seed])?;
        let take = (output_len - result.len()).min(block.len());
        result.extend_from_slice(&block[..take]);
        a = hmac_parts::<M>(secret, &[&a])?;
    }

    Ok(result)
}

fn label_seed(label: &[u8], seed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + seed.len());
    out.extend_from_slice(label);
    out.extend_from_slice(seed);
    out
}

/// TLS 1.0/1.1 PRF.
///
/// The secret is split into two halves (overlapping by one byte when its
/// length is odd); PRF = P_MD5(S1, label + seed) XOR P_SHA1(S2, label + seed).
pub fn tls_prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, KeyDerivationError> {
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];
    let seed = label_seed(label, seed);

    let mut out = p_hash::<Hmac<Md5>>(s1, &seed, output_len)?;
    let sha = p_hash::<Hmac<Sha1>>(s2, &seed, output_len)?;
    for (o, s) in out.iter_mut().zip(sha) {
        *o ^= s;
    }
    Ok(out)
}

/// TLS 1.2 PRF: P_SHA256(secret, label + seed).
pub fn tls12_prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, KeyDerivationError> {
    p_hash::<Hmac<Sha256>>(secret, &label_seed(label, seed), output_len)
}

/// The PRF selected by protocol version.
pub fn prf(
    version: ProtocolVersion,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, KeyDerivationError> {
    match version {
        ProtocolVersion::Tls12 => tls12_prf(secret, label, seed, output_len),
        _ => tls_prf(secret, label, seed, output_len),
    }
}

// ============================================================================
// Secret Derivation
// ============================================================================

/// Derive the 48-byte master secret from the pre-master secret.
///
/// master_secret = PRF(pre_master_secret, "master secret",
///                     client_random + server_random)
pub fn derive_master_secret(
    version: ProtocolVersion,
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<[u8; MASTER_SECRET_LEN], KeyDerivationError> {
    let material = match version {
        ProtocolVersion::Ssl3 => ssl3_expand(
            pre_master_secret,
            client_random,
            server_random,
            MASTER_SECRET_LEN,
        )?,
        _ => {
            let mut seed = Vec::with_capacity(64);
            seed.extend_from_slice(client_random);
            seed.extend_from_slice(server_random);
            prf(
                version,
                pre_master_secret,
                b"master secret",
                &seed,
                MASTER_SECRET_LEN,
            )?
        }
    };

    material
        .as_slice()
        .try_into()
        .map_err(|_| KeyDerivationError::InvalidKeyLength {
            expected: MASTER_SECRET_LEN,
            actual: material.len(),
        })
}

/// Expand the master secret into `output_len` bytes of key material.
///
/// key_block = PRF(master_secret, "key expansion",
///                 server_random + client_random)
pub fn derive_key_material(
    version: ProtocolVersion,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    output_len: usize,
) -> Result<Vec<u8>, KeyDerivationError> {
    match version {
        ProtocolVersion::Ssl3 => {
            ssl3_expand(master_secret, server_random, client_random, output_len)
        }
        _ => {
            // Note: order differs from master secret derivation
            let mut seed = Vec::with_capacity(64);
            seed.extend_from_slice(server_random);
            seed.extend_from_slice(client_random);
            prf(version, master_secret, b"key expansion", &seed, output_len)
        }
    }
}

/// Derive and partition the key block for a cipher suite.
pub fn derive_key_block(
    version: ProtocolVersion,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    suite: &CipherSuite,
) -> Result<KeyBlock, KeyDerivationError> {
    let material = derive_key_material(
        version,
        master_secret,
        client_random,
        server_random,
        suite.key_block_len(),
    )?;
    KeyBlock::partition(&material, suite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher_suite;

    const KAT: &str = include_str!("../../testdata/kat.txt");

    fn kat(name: &str) -> Vec<u8> {
        KAT.lines()
            .find_map(|line| {
                let (key, value) = line.split_once(' ')?;
                (key == name).then(|| hex::decode(value.trim()).unwrap())
            })
            .unwrap_or_else(|| panic!("missing vector {name}"))
    }

    fn client_random() -> [u8; 32] {
        std::array::from_fn(|i| i as u8 + 0x01)
    }

    fn server_random() -> [u8; 32] {
        std::array::from_fn(|i| i as u8 + 0x21)
    }

    fn master() -> Vec<u8> {
        (0x00u8..0x30).collect()
    }

    fn pre_master() -> Vec<u8> {
        let mut pms = vec![3, 1];
        pms.extend(0x50u8..0x7e);
        pms
    }

    // Test 1: TLS 1.0 key block matches known answer
    #[test]
    fn test_tls10_key_block_vector() {
        let block = derive_key_material(
            ProtocolVersion::Tls10,
            &master(),
            &client_random(),
            &server_random(),
            104,
        )
        .unwrap();
        assert_eq!(block, kat("tls10_key_block"));
    }

    // Test 2: TLS 1.2 key block uses the SHA256 PRF
    #[test]
    fn test_tls12_key_block_vector() {
        let block = derive_key_material(
            ProtocolVersion::Tls12,
            &master(),
            &client_random(),
            &server_random(),
            136,
        )
        .unwrap();
        assert_eq!(block, kat("tls12_key_block"));
    }

    // Test 3: SSL3 key block
    #[test]
    fn test_ssl3_key_block_vector() {
        let block = derive_key_material(
            ProtocolVersion::Ssl3,
            &master(),
            &client_random(),
            &server_random(),
            104,
        )
        .unwrap();
        assert_eq!(block, kat("ssl3_key_block"));
    }

    // Test 4: Master secrets
    #[test]
    fn test_master_secret_vectors() {
        let tls = derive_master_secret(
            ProtocolVersion::Tls10,
            &pre_master(),
            &client_random(),
            &server_random(),
        )
        .unwrap();
        assert_eq!(tls.to_vec(), kat("tls10_master"));

        let ssl3 = derive_master_secret(
            ProtocolVersion::Ssl3,
            &pre_master(),
            &client_random(),
            &server_random(),
        )
        .unwrap();
        assert_eq!(ssl3.to_vec(), kat("ssl3_master"));
    }

    // Test 5: Derivation is deterministic and length-exact
    #[test]
    fn test_key_material_deterministic() {
        for len in [1, 16, 33, 104, 200] {
            let a = derive_key_material(
                ProtocolVersion::Tls11,
                &master(),
                &client_random(),
                &server_random(),
                len,
            )
            .unwrap();
            let b = derive_key_material(
                ProtocolVersion::Tls11,
                &master(),
                &client_random(),
                &server_random(),
                len,
            )
            .unwrap();
            assert_eq!(a.len(), len);
            assert_eq!(a, b);
        }
    }

    // Test 6: Shorter output is a prefix of longer output
    #[test]
    fn test_prf_prefix_property() {
        let long = tls_prf(&master(), b"key expansion", b"seed", 100).unwrap();
        let short = tls_prf(&master(), b"key expansion", b"seed", 40).unwrap();
        assert_eq!(&long[..40], short.as_slice());
    }

    // Test 7: Key block partition layout
    #[test]
    fn test_key_block_partition() {
        let suite = cipher_suite::from_id(0x002f).unwrap();
        let material: Vec<u8> = (0..104).map(|i| i as u8).collect();
        let block = KeyBlock::partition(&material, suite).unwrap();

        assert_eq!(block.client_write_mac_key, material[0..20]);
        assert_eq!(block.server_write_mac_key, material[20..40]);
        assert_eq!(block.client_write_key, material[40..56]);
        assert_eq!(block.server_write_key, material[56..72]);
        assert_eq!(block.client_write_iv, material[72..88]);
        assert_eq!(block.server_write_iv, material[88..104]);
    }

    // Test 8: Short material is rejected
    #[test]
    fn test_key_block_partition_short() {
        let suite = cipher_suite::from_id(0x0035).unwrap();
        assert_eq!(
            KeyBlock::partition(&[0u8; 50], suite),
            Err(KeyDerivationError::InvalidKeyLength {
                expected: 136,
                actual: 50
            })
        );
    }

    // Test 9: Stream cipher key blocks have no IVs
    #[test]
    fn test_rc4_key_block_has_no_iv() {
        let suite = cipher_suite::from_id(0x0005).unwrap();
        let block = derive_key_block(
            ProtocolVersion::Tls10,
            &master(),
            &client_random(),
            &server_random(),
            suite,
        )
        .unwrap();
        assert!(block.client_write_iv.is_empty());
        assert_eq!(block.server_write_key.len(), 16);
    }

    // Test 10: Version mapping
    #[test]
    fn test_protocol_version() {
        assert_eq!(ProtocolVersion::from_minor(0).unwrap(), ProtocolVersion::Ssl3);
        assert_eq!(ProtocolVersion::from_minor(3).unwrap(), ProtocolVersion::Tls12);
        assert_eq!(
            ProtocolVersion::from_minor(4),
            Err(KeyDerivationError::UnsupportedVersion(4))
        );
        assert!(!ProtocolVersion::Tls10.has_explicit_iv());
        assert!(ProtocolVersion::Tls11.has_explicit_iv());
        assert!(!ProtocolVersion::Ssl3.has_length_prefixed_exchange());
    }
}
