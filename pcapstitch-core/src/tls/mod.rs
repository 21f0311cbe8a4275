//! Passive TLS decryption using server RSA private keys.
//!
//! Sessions that negotiate an RSA key exchange can be decrypted by an
//! observer holding the server's private key: the ClientKeyExchange carries
//! the pre-master secret encrypted under the server's public key.
//!
//! ## Architecture
//!
//! ```text
//! TCP payload -> TlsSession (record framing, handshake parsing)
//!                    |
//!                    v
//!   PrivateKeyStore -> pre-master secret -> kdf (SSLv3 / TLS PRF)
//!                    |                          |
//!                    v                          v
//!            MasterSecretCache            KeyBlock -> RecordDecryptor
//!            (session resumption)                     (RC4, 3DES, AES, Camellia)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pcapstitch_core::tls::{PrivateKeyStore, TlsContext, TlsDirection, TlsSession};
//!
//! let keys = PrivateKeyStore::from_path("server.key")?;
//! let ctx = Arc::new(TlsContext::new(keys));
//! let mut session = TlsSession::new("10.0.0.2".parse().unwrap(), ctx);
//!
//! let plaintext = session.process(TlsDirection::ClientToServer, &[]);
//! # Ok::<(), pcapstitch_core::tls::KeyStoreError>(())
//! ```
//!
//! ## Supported Cipher Suites
//!
//! RSA key exchange with RC4-128, 3DES-EDE-CBC, AES-128/256-CBC and
//! Camellia-128/256-CBC, using MD5, SHA-1 or SHA-256 MACs, on SSLv3 through
//! TLS 1.2.

pub mod cipher_suite;
pub mod decrypt;
pub mod der;
pub mod kdf;
pub mod keys;
pub mod session;

pub use cipher_suite::{BulkCipher, CipherSuite, CipherSuiteError};
pub use decrypt::{DecryptionError, Direction, Direction as TlsDirection, RecordDecryptor};
pub use der::{DerError, DerReader};
pub use kdf::{KeyBlock, KeyDerivationError, ProtocolVersion, MASTER_SECRET_LEN};
pub use keys::{KeySelector, KeyStoreError, PrivateKeyStore};
pub use session::{KeyPhase, KeyState, MasterSecretCache, SessionError, TlsContext, TlsSession};
