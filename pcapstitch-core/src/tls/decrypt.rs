//! TLS record decryption engine.
//!
//! Implements decryption of the pre-AEAD record protections negotiated by RSA
//! key exchange suites:
//! - AES-128/256, 3DES-EDE and Camellia-128/256 in CBC mode
//! - RC4-128
//!
//! MACs are stripped but not verified.

use std::fmt;

use aes::{Aes128, Aes256};
use camellia::{Camellia128, Camellia256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, KeyInit, StreamCipher};
use des::TdesEde3;
use rc4::consts::U16;
use rc4::Rc4;
use thiserror::Error;

use super::cipher_suite::{BulkCipher, CipherSuite};
use super::kdf::{KeyBlock, ProtocolVersion};

/// Errors during TLS record decryption.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("Ciphertext length {len} is not a positive multiple of the {block_size}-byte block")]
    InvalidCiphertextLength { len: usize, block_size: usize },

    #[error("Ciphertext too short: minimum {min_len} bytes, got {actual}")]
    CiphertextTooShort { min_len: usize, actual: usize },
}

/// Direction of TLS traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

enum BlockCipher {
    Aes128(Aes128),
    Aes256(Aes256),
    TdesEde3(TdesEde3),
    Camellia128(Camellia128),
    Camellia256(Camellia256),
}

impl BlockCipher {
    /// Decrypt one block in place. `block` must be exactly one block long.
    fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::TdesEde3(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Camellia128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Camellia256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

enum CipherState {
    Cbc {
        cipher: BlockCipher,
        /// Running IV: the last ciphertext block of the previous record.
        iv: Vec<u8>,
    },
    Rc4(Box<Rc4<U16>>),
}

/// Decrypts the records of one direction of a connection.
///
/// CBC state carries its running IV and RC4 state its keystream position
/// from record to record, so every record of the direction must pass through
/// the same decryptor in order.
pub struct RecordDecryptor {
    suite: &'static CipherSuite,
    version: ProtocolVersion,
    state: CipherState,
    records: u64,
}

impl fmt::Debug for RecordDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordDecryptor")
            .field("suite", &self.suite.name)
            .field("version", &self.version)
            .field("records", &self.records)
            .finish()
    }
}

impl RecordDecryptor {
    /// Create a decryptor from a write key and IV (empty IV for stream ciphers).
    pub fn new(
        suite: &'static CipherSuite,
        version: ProtocolVersion,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self, DecryptionError> {
        if key.len() != suite.write_key_size {
            return Err(DecryptionError::InvalidKeyLength {
                expected: suite.write_key_size,
                actual: key.len(),
            });
        }
        if iv.len() != suite.iv_len() {
            return Err(DecryptionError::InvalidIvLength {
                expected: suite.iv_len(),
                actual: iv.len(),
            });
        }

        let invalid = |_| DecryptionError::InvalidKeyLength {
            expected: suite.write_key_size,
            actual: key.len(),
        };
        let cbc = |cipher| CipherState::Cbc {
            cipher,
            iv: iv.to_vec(),
        };
        let state = match suite.bulk {
            BulkCipher::Rc4 => {
                CipherState::Rc4(Box::new(Rc4::<U16>::new_from_slice(key).map_err(invalid)?))
            }
            BulkCipher::Aes128 => cbc(BlockCipher::Aes128(
                Aes128::new_from_slice(key).map_err(invalid)?,
            )),
            BulkCipher::Aes256 => cbc(BlockCipher::Aes256(
                Aes256::new_from_slice(key).map_err(invalid)?,
            )),
            BulkCipher::TripleDesEde => cbc(BlockCipher::TdesEde3(
                TdesEde3::new_from_slice(key).map_err(invalid)?,
            )),
            BulkCipher::Camellia128 => cbc(BlockCipher::Camellia128(
                Camellia128::new_from_slice(key).map_err(invalid)?,
            )),
            BulkCipher::Camellia256 => cbc(BlockCipher::Camellia256(
                Camellia256::new_from_slice(key).map_err(invalid)?,
            )),
        };

        Ok(Self {
            suite,
            version,
            state,
            records: 0,
        })
    }

    /// Create the decryptor for one direction from a derived key block.
    pub fn from_key_block(
        block: &KeyBlock,
        suite: &'static CipherSuite,
        version: ProtocolVersion,
        direction: Direction,
    ) -> Result<Self, DecryptionError> {
        match direction {
            Direction::ClientToServer => Self::new(
                suite,
                version,
                &block.client_write_key,
                &block.client_write_iv,
            ),
            Direction::ServerToClient => Self::new(
                suite,
                version,
                &block.server_write_key,
                &block.server_write_iv,
            ),
        }
    }

    pub fn suite(&self) -> &'static CipherSuite {
        self.suite
    }

    /// Number of records decrypted so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Decrypt one record fragment and return its plaintext content.
    pub fn decrypt_record(&mut self, fragment: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        let mac_len = self.suite.mac_key_size;
        let explicit_iv = self.version.has_explicit_iv();

        let plaintext = match &mut self.state {
            CipherState::Rc4(rc4) => {
                if fragment.len() < mac_len {
                    return Err(DecryptionError::CiphertextTooShort {
                        min_len: mac_len,
                        actual: fragment.len(),
                    });
                }
                let mut data = fragment.to_vec();
                rc4.apply_keystream(&mut data);
                data.truncate(data.len() - mac_len);
                data
            }
            CipherState::Cbc { cipher, iv } => {
                let bs = iv.len();
                if fragment.is_empty() || fragment.len() % bs != 0 {
                    return Err(DecryptionError::InvalidCiphertextLength {
                        len: fragment.len(),
                        block_size: bs,
                    });
                }

                let mut data = fragment.to_vec();
                for (plain, ct) in data.chunks_exact_mut(bs).zip(fragment.chunks_exact(bs)) {
                    cipher.decrypt_block(plain);
                    for (p, v) in plain.iter_mut().zip(iv.iter()) {
                        *p ^= v;
                    }
                    iv.copy_from_slice(ct);
                }

                let padding = usize::from(data[data.len() - 1]) + 1;
                let prefix = if explicit_iv { bs } else { 0 };
                let min_len = padding + mac_len + prefix;
                if data.len() < min_len {
                    return Err(DecryptionError::CiphertextTooShort {
                        min_len,
                        actual: data.len(),
                    });
                }
                data.truncate(data.len() - padding - mac_len);
                data.drain(..prefix);
                data
            }
        };

        self.records += 1;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher_suite;
    use cipher::BlockEncrypt;

    /// CBC-encrypt `content + mac + padding` with AES-128, chaining from `iv`.
    fn aes128_cbc_record(key: &[u8], iv: &mut Vec<u8>, body: &[u8], mac_len: usize) -> Vec<u8> {
        let cipher = Aes128::new_from_slice(key).unwrap();
        let mut data = body.to_vec();
        data.extend(std::iter::repeat(0xaa).take(mac_len));
        let pad = 16 - (data.len() + 1) % 16;
        data.extend(std::iter::repeat(pad as u8).take(pad + 1));

        for block in data.chunks_exact_mut(16) {
            for (b, v) in block.iter_mut().zip(iv.iter()) {
                *b ^= v;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
            iv.copy_from_slice(block);
        }
        data
    }

    // Test 1: Chained CBC records decrypt with the running IV
    #[test]
    fn test_cbc_records_chain() {
        let suite = cipher_suite::from_id(0x002f).unwrap();
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];

        let mut enc_iv = iv.to_vec();
        let first = aes128_cbc_record(&key, &mut enc_iv, b"first record", 20);
        let second = aes128_cbc_record(&key, &mut enc_iv, b"second record, a bit longer", 20);

        let mut dec = RecordDecryptor::new(suite, ProtocolVersion::Tls10, &key, &iv).unwrap();
        assert_eq!(dec.decrypt_record(&first).unwrap(), b"first record");
        assert_eq!(
            dec.decrypt_record(&second).unwrap(),
            b"second record, a bit longer"
        );
        assert_eq!(dec.records(), 2);
    }

    // Test 2: Explicit IV block is dropped from TLS 1.1 on
    #[test]
    fn test_cbc_explicit_iv() {
        let suite = cipher_suite::from_id(0x002f).unwrap();
        let key = [0x33u8; 16];

        let mut body = vec![0x5au8; 16]; // explicit IV travels as the first block
        body.extend_from_slice(b"payload");
        let mut enc_iv = vec![0x44u8; 16];
        let record = aes128_cbc_record(&key, &mut enc_iv, &body, 20);

        // Running IV is unrelated; only the first block is garbled
        let mut dec =
            RecordDecryptor::new(suite, ProtocolVersion::Tls11, &key, &[0u8; 16]).unwrap();
        assert_eq!(dec.decrypt_record(&record).unwrap(), b"payload");
    }

    // Test 3: RC4 keystream persists across records
    #[test]
    fn test_rc4_stream_state() {
        let suite = cipher_suite::from_id(0x0005).unwrap();
        let key = [0x7fu8; 16];

        let mut enc = Rc4::<U16>::new_from_slice(&key).unwrap();
        let mut first = b"hello".to_vec();
        first.extend_from_slice(&[0u8; 20]);
        enc.apply_keystream(&mut first);
        let mut second = b"world".to_vec();
        second.extend_from_slice(&[0u8; 20]);
        enc.apply_keystream(&mut second);

        let mut dec = RecordDecryptor::new(suite, ProtocolVersion::Tls10, &key, &[]).unwrap();
        assert_eq!(dec.decrypt_record(&first).unwrap(), b"hello");
        assert_eq!(dec.decrypt_record(&second).unwrap(), b"world");
    }

    // Test 4: Partial blocks are rejected
    #[test]
    fn test_cbc_invalid_length() {
        let suite = cipher_suite::from_id(0x000a).unwrap();
        let mut dec =
            RecordDecryptor::new(suite, ProtocolVersion::Tls10, &[1u8; 24], &[2u8; 8]).unwrap();
        assert_eq!(
            dec.decrypt_record(&[0u8; 12]),
            Err(DecryptionError::InvalidCiphertextLength {
                len: 12,
                block_size: 8
            })
        );
        assert!(dec.decrypt_record(&[]).is_err());
    }

    // Test 5: Padding longer than the record is an error, not a panic
    #[test]
    fn test_cbc_bad_padding() {
        let suite = cipher_suite::from_id(0x002f).unwrap();
        let key = [0x10u8; 16];
        // Single block decrypting to all 0xff: padding claims 256 bytes
        let cipher = Aes128::new_from_slice(&key).unwrap();
        let mut block = [0xffu8; 16];
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));

        let mut dec =
            RecordDecryptor::new(suite, ProtocolVersion::Tls10, &key, &[0u8; 16]).unwrap();
        assert!(matches!(
            dec.decrypt_record(&block),
            Err(DecryptionError::CiphertextTooShort { .. })
        ));
    }

    // Test 6: Key and IV sizes are checked against the suite
    #[test]
    fn test_invalid_key_material() {
        let suite = cipher_suite::from_id(0x0035).unwrap();
        assert_eq!(
            RecordDecryptor::new(suite, ProtocolVersion::Tls12, &[0u8; 16], &[0u8; 16])
                .unwrap_err(),
            DecryptionError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        );
        assert_eq!(
            RecordDecryptor::new(suite, ProtocolVersion::Tls12, &[0u8; 32], &[0u8; 8])
                .unwrap_err(),
            DecryptionError::InvalidIvLength {
                expected: 16,
                actual: 8
            }
        );
    }

    // Test 7: Camellia decryptor builds from a key block
    #[test]
    fn test_from_key_block() {
        let suite = cipher_suite::from_id(0x0041).unwrap();
        let material: Vec<u8> = (0..suite.key_block_len()).map(|i| i as u8).collect();
        let block = KeyBlock::partition(&material, suite).unwrap();
        let dec = RecordDecryptor::from_key_block(
            &block,
            suite,
            ProtocolVersion::Tls10,
            Direction::ServerToClient,
        )
        .unwrap();
        assert_eq!(dec.suite().id, 0x0041);
        assert_eq!(dec.records(), 0);
    }
}
