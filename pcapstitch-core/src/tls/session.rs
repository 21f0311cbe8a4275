//! TLS session state management.
//!
//! Follows one connection's record stream in both directions, collecting the
//! handshake values needed for key derivation (randoms, session ID, cipher
//! suite, encrypted pre-master secret) and decrypting records once a
//! direction's ChangeCipherSpec has been seen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use thiserror::Error;

use super::cipher_suite::{self, CipherSuite, CipherSuiteError};
use super::decrypt::{DecryptionError, Direction, RecordDecryptor};
use super::der::{self, DerError};
use super::kdf::{self, KeyDerivationError, ProtocolVersion, MASTER_SECRET_LEN};
use super::keys::{self, PrivateKeyStore};

/// Record content types.
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

/// Handshake message types.
pub const HS_HELLO_REQUEST: u8 = 0;
pub const HS_CLIENT_HELLO: u8 = 1;
pub const HS_SERVER_HELLO: u8 = 2;
pub const HS_CERTIFICATE: u8 = 11;
pub const HS_CLIENT_KEY_EXCHANGE: u8 = 16;

pub const RECORD_HEADER_LEN: usize = 5;
/// Largest legal TLSCiphertext fragment (2^14 + 2048).
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

/// Errors that can occur during TLS session management.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(#[from] KeyDerivationError),

    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("{0}")]
    CipherSuite(#[from] CipherSuiteError),

    #[error("Certificate parsing failed: {0}")]
    Certificate(#[from] DerError),

    #[error("Pre-master secret decryption failed: {0}")]
    PreMaster(#[from] rsa::Error),

    #[error("Truncated {0} message")]
    Truncated(&'static str),

    #[error("Missing {0} before key derivation")]
    MissingHandshakeData(&'static str),
}

// ============================================================================
// Shared context
// ============================================================================

/// Process-independent cache of master secrets by session ID, used to
/// decrypt abbreviated (resumed) handshakes.
///
/// Entries are never evicted; the cache grows with the number of distinct
/// session IDs observed.
#[derive(Debug, Default)]
pub struct MasterSecretCache {
    secrets: Mutex<HashMap<Vec<u8>, [u8; MASTER_SECRET_LEN]>>,
}

impl MasterSecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: &[u8], master_secret: [u8; MASTER_SECRET_LEN]) {
        self.secrets.lock().insert(session_id.to_vec(), master_secret);
    }

    pub fn get(&self, session_id: &[u8]) -> Option<[u8; MASTER_SECRET_LEN]> {
        self.secrets.lock().get(session_id).copied()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by every TLS session of one engine: the private keys and the
/// master secret cache.
#[derive(Debug, Default)]
pub struct TlsContext {
    keys: PrivateKeyStore,
    master_secrets: MasterSecretCache,
}

impl TlsContext {
    pub fn new(keys: PrivateKeyStore) -> Self {
        Self {
            keys,
            master_secrets: MasterSecretCache::new(),
        }
    }

    pub fn keys(&self) -> &PrivateKeyStore {
        &self.keys
    }

    pub fn master_secrets(&self) -> &MasterSecretCache {
        &self.master_secrets
    }
}

// ============================================================================
// Per-direction key register
// ============================================================================

/// Key register of one direction.
///
/// Keys derived during a handshake wait in the pending slot until that
/// direction's ChangeCipherSpec swaps them in.
#[derive(Debug, Default)]
pub enum KeyState {
    /// No ChangeCipherSpec seen; records are plaintext.
    #[default]
    Plaintext,
    /// Keys derived, ChangeCipherSpec not yet seen.
    PendingKeys(RecordDecryptor),
    /// Records are encrypted with `current`; `pending` holds keys from a
    /// renegotiation in progress.
    Active {
        current: RecordDecryptor,
        pending: Option<RecordDecryptor>,
    },
    /// ChangeCipherSpec seen without keys; records cannot be read.
    Opaque,
}

/// Discriminant of [`KeyState`] for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Plaintext,
    PendingKeys,
    Active,
    Opaque,
}

impl KeyState {
    pub fn phase(&self) -> KeyPhase {
        match self {
            KeyState::Plaintext => KeyPhase::Plaintext,
            KeyState::PendingKeys(_) => KeyPhase::PendingKeys,
            KeyState::Active { .. } => KeyPhase::Active,
            KeyState::Opaque => KeyPhase::Opaque,
        }
    }

    /// Store freshly derived keys until the next ChangeCipherSpec.
    pub fn stage(&mut self, keys: RecordDecryptor) {
        *self = match std::mem::take(self) {
            KeyState::Active { current, .. } => KeyState::Active {
                current,
                pending: Some(keys),
            },
            _ => KeyState::PendingKeys(keys),
        };
    }

    /// Swap in the pending keys.
    pub fn change_cipher_spec(&mut self) {
        *self = match std::mem::take(self) {
            KeyState::PendingKeys(keys)
            | KeyState::Active {
                pending: Some(keys),
                ..
            } => KeyState::Active {
                current: keys,
                pending: None,
            },
            KeyState::Active {
                current,
                pending: None,
            } => {
                tracing::debug!("ChangeCipherSpec without new keys, keeping current keys");
                KeyState::Active {
                    current,
                    pending: None,
                }
            }
            KeyState::Plaintext | KeyState::Opaque => KeyState::Opaque,
        };
    }

    /// Whether ChangeCipherSpec has been seen on this direction.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, KeyState::Active { .. } | KeyState::Opaque)
    }

    fn active_mut(&mut self) -> Option<&mut RecordDecryptor> {
        match self {
            KeyState::Active { current, .. } => Some(current),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DirectionState {
    keys: KeyState,
    /// Trailing partial record waiting for the next segment.
    partial: Vec<u8>,
}

// ============================================================================
// Session
// ============================================================================

/// Handshake and record state of one TLS connection.
#[derive(Debug)]
pub struct TlsSession {
    server_ip: IpAddr,
    ctx: Arc<TlsContext>,
    warned_no_key: bool,

    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    session_id: Vec<u8>,
    cipher_suite: Option<&'static CipherSuite>,
    /// Version from ServerHello
    version: Option<ProtocolVersion>,
    encrypted_pre_master: Option<Vec<u8>>,
    hello_requested: bool,

    directions: [DirectionState; 2],
}

impl TlsSession {
    /// Create the session for a connection to `server_ip`.
    pub fn new(server_ip: IpAddr, ctx: Arc<TlsContext>) -> Self {
        Self {
            server_ip,
            ctx,
            warned_no_key: false,
            client_random: None,
            server_random: None,
            session_id: Vec::new(),
            cipher_suite: None,
            version: None,
            encrypted_pre_master: None,
            hello_requested: false,
            directions: Default::default(),
        }
    }

    /// Whether a private key is configured for this server.
    pub fn is_decryptable(&self) -> bool {
        self.ctx.keys().has_key_for(&self.server_ip)
    }

    pub fn client_random(&self) -> Option<&[u8; 32]> {
        self.client_random.as_ref()
    }

    pub fn server_random(&self) -> Option<&[u8; 32]> {
        self.server_random.as_ref()
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn cipher_suite(&self) -> Option<&'static CipherSuite> {
        self.cipher_suite
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn key_phase(&self, direction: Direction) -> KeyPhase {
        self.directions[direction.index()].keys.phase()
    }

    /// Feed one TCP payload of a direction and return the bytes to append to
    /// the reconstructed stream.
    ///
    /// Without a usable private key the payload is returned unchanged.
    /// Otherwise only application data is returned: decrypted when keys are
    /// active, as the raw record when they are not.
    pub fn process(&mut self, direction: Direction, payload: &[u8]) -> Vec<u8> {
        let ctx = Arc::clone(&self.ctx);
        let Some(key) = ctx.keys().lookup(&self.server_ip) else {
            if !self.warned_no_key {
                tracing::warn!(
                    server = %self.server_ip,
                    "No private key for server, passing TLS stream through undecrypted"
                );
                self.warned_no_key = true;
            }
            return payload.to_vec();
        };

        let state = &mut self.directions[direction.index()];
        let buffer = if state.partial.is_empty() {
            payload.to_vec()
        } else {
            let mut buffer = std::mem::take(&mut state.partial);
            buffer.extend_from_slice(payload);
            buffer
        };

        let mut output = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            let rest = &buffer[offset..];

            if is_sslv2_client_hello(rest) {
                let len = (usize::from(rest[0] & 0x7f) << 8) | usize::from(rest[1]);
                if let Some(random) = sslv2_client_random(rest) {
                    tracing::debug!(server = %self.server_ip, "SSLv2 ClientHello");
                    self.client_random = Some(random);
                }
                offset += 2 + len;
                continue;
            }

            let content_type = rest[0];
            if !(CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_APPLICATION_DATA).contains(&content_type) {
                tracing::debug!(
                    server = %self.server_ip,
                    content_type,
                    dropped = rest.len(),
                    "Not a TLS record, dropping rest of payload"
                );
                break;
            }

            if rest.len() < RECORD_HEADER_LEN {
                self.directions[direction.index()].partial = rest.to_vec();
                break;
            }

            let minor = rest[2];
            let len = usize::from(u16::from_be_bytes([rest[3], rest[4]]));
            if len > MAX_RECORD_LEN {
                tracing::debug!(
                    server = %self.server_ip,
                    len,
                    "Oversized TLS record, dropping rest of payload"
                );
                break;
            }
            if rest.len() < RECORD_HEADER_LEN + len {
                self.directions[direction.index()].partial = rest.to_vec();
                break;
            }

            let record = &rest[..RECORD_HEADER_LEN + len];
            self.process_record(key, direction, content_type, minor, record, &mut output);
            offset += record.len();
        }

        output
    }

    fn process_record(
        &mut self,
        key: &RsaPrivateKey,
        direction: Direction,
        content_type: u8,
        minor: u8,
        record: &[u8],
        output: &mut Vec<u8>,
    ) {
        let fragment = &record[RECORD_HEADER_LEN..];

        // A cleartext ClientHello outside a requested renegotiation starts a
        // new connection, whatever keys are active
        if content_type == CONTENT_HANDSHAKE
            && direction == Direction::ClientToServer
            && !self.hello_requested
            && self.directions[direction.index()].keys.is_encrypted()
            && is_plaintext_client_hello(fragment)
        {
            tracing::debug!(
                server = %self.server_ip,
                "Cleartext ClientHello, restarting handshake"
            );
            for state in &mut self.directions {
                state.keys = KeyState::Plaintext;
            }
        }

        let keys = &mut self.directions[direction.index()].keys;

        match content_type {
            CONTENT_CHANGE_CIPHER_SPEC => {
                keys.change_cipher_spec();
                tracing::trace!(?direction, phase = ?keys.phase(), "ChangeCipherSpec");
            }
            CONTENT_APPLICATION_DATA => match keys.active_mut() {
                Some(decryptor) => match decryptor.decrypt_record(fragment) {
                    Ok(plaintext) => output.extend_from_slice(&plaintext),
                    Err(e) => {
                        tracing::warn!(
                            server = %self.server_ip,
                            ?direction,
                            error = %e,
                            "Application data decryption failed"
                        );
                        output.extend_from_slice(record);
                    }
                },
                None => output.extend_from_slice(record),
            },
            CONTENT_HANDSHAKE => {
                let encrypted = keys.is_encrypted();
                let plaintext = match keys.active_mut() {
                    Some(decryptor) => match decryptor.decrypt_record(fragment) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            tracing::debug!(error = %e, "Encrypted handshake decryption failed");
                            return;
                        }
                    },
                    None if encrypted => return,
                    None => fragment.to_vec(),
                };
                self.process_handshake(key, direction, minor, &plaintext, encrypted);
            }
            CONTENT_ALERT => {
                // Decrypt to keep the cipher state in step
                if let Some(decryptor) = keys.active_mut() {
                    if let Err(e) = decryptor.decrypt_record(fragment) {
                        tracing::trace!(?direction, error = %e, "Alert decryption failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Parse every handshake message in a record.
    fn process_handshake(
        &mut self,
        key: &RsaPrivateKey,
        direction: Direction,
        minor: u8,
        data: &[u8],
        encrypted: bool,
    ) {
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let msg_type = data[offset];
            let len = u24(&data[offset + 1..offset + 4]);
            let Some(body) = data.get(offset + 4..offset + 4 + len) else {
                tracing::debug!(msg_type, len, "Handshake message spans records, skipping");
                return;
            };

            if let Err(e) =
                self.process_handshake_message(key, direction, msg_type, minor, body, encrypted)
            {
                match e {
                    SessionError::CipherSuite(_) | SessionError::PreMaster(_) => {
                        tracing::warn!(server = %self.server_ip, error = %e, "TLS handshake")
                    }
                    _ => tracing::debug!(server = %self.server_ip, error = %e, "TLS handshake"),
                }
            }
            offset += 4 + len;
        }
    }

    fn process_handshake_message(
        &mut self,
        key: &RsaPrivateKey,
        direction: Direction,
        msg_type: u8,
        minor: u8,
        body: &[u8],
        encrypted: bool,
    ) -> Result<(), SessionError> {
        match msg_type {
            HS_HELLO_REQUEST => {
                self.hello_requested = true;
            }
            HS_CLIENT_HELLO => {
                // An unsolicited cleartext ClientHello starts a fresh connection
                if !encrypted && !self.hello_requested {
                    for state in &mut self.directions {
                        state.keys = KeyState::Plaintext;
                    }
                }
                self.hello_requested = false;
                self.server_random = None;
                self.encrypted_pre_master = None;
                self.client_random = Some(
                    body.get(2..34)
                        .and_then(|r| r.try_into().ok())
                        .ok_or(SessionError::Truncated("ClientHello"))?,
                );
            }
            HS_SERVER_HELLO => self.process_server_hello(key, body)?,
            HS_CERTIFICATE => self.process_certificate(key, body)?,
            HS_CLIENT_KEY_EXCHANGE => {
                let version = match self.version {
                    Some(version) => version,
                    None => ProtocolVersion::from_minor(minor)?,
                };
                let ciphertext = if version.has_length_prefixed_exchange() {
                    let len = body
                        .get(..2)
                        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
                        .ok_or(SessionError::Truncated("ClientKeyExchange"))?;
                    body.get(2..2 + len)
                        .ok_or(SessionError::Truncated("ClientKeyExchange"))?
                } else {
                    body
                };
                self.encrypted_pre_master = Some(ciphertext.to_vec());
                self.derive_from_pre_master(key)?;
            }
            other => {
                tracing::trace!(?direction, msg_type = other, "Handshake message");
            }
        }
        Ok(())
    }

    fn process_server_hello(
        &mut self,
        key: &RsaPrivateKey,
        body: &[u8],
    ) -> Result<(), SessionError> {
        const TRUNCATED: SessionError = SessionError::Truncated("ServerHello");
        let minor = *body.get(1).ok_or(TRUNCATED)?;
        let random: [u8; 32] = body
            .get(2..34)
            .and_then(|r| r.try_into().ok())
            .ok_or(TRUNCATED)?;
        let sid_len = usize::from(*body.get(34).ok_or(TRUNCATED)?);
        let session_id = body.get(35..35 + sid_len).ok_or(TRUNCATED)?;
        let suite_id = body.get(35 + sid_len..37 + sid_len).ok_or(TRUNCATED)?;

        let version = ProtocolVersion::from_minor(minor)?;
        self.server_random = Some(random);
        self.session_id = session_id.to_vec();
        self.version = Some(version);
        self.cipher_suite = None;
        let suite = cipher_suite::lookup([suite_id[0], suite_id[1]])?;
        self.cipher_suite = Some(suite);

        tracing::debug!(
            server = %self.server_ip,
            version = version.as_str(),
            cipher_suite = suite.name,
            session_id_len = sid_len,
            "ServerHello"
        );

        if !self.session_id.is_empty() {
            if let Some(master) = self.ctx.master_secrets().get(&self.session_id) {
                tracing::debug!(server = %self.server_ip, "Resuming cached session");
                return self.stage_keys(&master);
            }
        }
        if self.encrypted_pre_master.is_some() {
            self.derive_from_pre_master(key)?;
        }
        Ok(())
    }

    /// Compare the server certificate's modulus with the configured key.
    fn process_certificate(&self, key: &RsaPrivateKey, body: &[u8]) -> Result<(), SessionError> {
        let cert_len = body
            .get(3..6)
            .map(u24)
            .ok_or(SessionError::Truncated("Certificate"))?;
        let cert = body
            .get(6..6 + cert_len)
            .ok_or(SessionError::Truncated("Certificate"))?;
        let modulus = der::rsa_modulus_from_certificate(cert)?;
        if keys::modulus_bytes(key) != modulus {
            tracing::warn!(
                server = %self.server_ip,
                "Server certificate does not match the configured private key"
            );
        }
        Ok(())
    }

    fn derive_from_pre_master(&mut self, key: &RsaPrivateKey) -> Result<(), SessionError> {
        let (Some(client_random), Some(server_random)) = (self.client_random, self.server_random)
        else {
            return Err(SessionError::MissingHandshakeData("hello randoms"));
        };
        let Some(ciphertext) = self.encrypted_pre_master.as_deref() else {
            return Err(SessionError::MissingHandshakeData("ClientKeyExchange"));
        };
        let version = self
            .version
            .ok_or(SessionError::MissingHandshakeData("ServerHello"))?;

        let pre_master = keys::decrypt_pre_master(key, ciphertext)?;
        let master =
            kdf::derive_master_secret(version, &pre_master, &client_random, &server_random)?;

        if !self.session_id.is_empty() {
            self.ctx.master_secrets().insert(&self.session_id, master);
        }
        self.stage_keys(&master)
    }

    /// Derive both directions' decryptors and stage them.
    fn stage_keys(&mut self, master: &[u8; MASTER_SECRET_LEN]) -> Result<(), SessionError> {
        let (Some(client_random), Some(server_random)) = (self.client_random, self.server_random)
        else {
            return Err(SessionError::MissingHandshakeData("hello randoms"));
        };
        let suite = self
            .cipher_suite
            .ok_or(SessionError::MissingHandshakeData("cipher suite"))?;
        let version = self
            .version
            .ok_or(SessionError::MissingHandshakeData("ServerHello"))?;

        let block = kdf::derive_key_block(version, master, &client_random, &server_random, suite)?;
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            let decryptor = RecordDecryptor::from_key_block(&block, suite, version, direction)?;
            self.directions[direction.index()].keys.stage(decryptor);
        }

        tracing::debug!(
            server = %self.server_ip,
            cipher_suite = suite.name,
            "Derived session keys"
        );
        Ok(())
    }
}

fn u24(bytes: &[u8]) -> usize {
    (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2])
}

/// Cleartext ClientHello: message type, a body length that fits the record
/// and a TLS client version.
fn is_plaintext_client_hello(fragment: &[u8]) -> bool {
    fragment.len() >= 6
        && fragment[0] == HS_CLIENT_HELLO
        && 4 + u24(&fragment[1..4]) <= fragment.len()
        && fragment[4] == 3
}

/// SSLv2-framed ClientHello: high bit set on the first header byte and
/// message type 1 after the two-byte header.
fn is_sslv2_client_hello(data: &[u8]) -> bool {
    data.len() > 2
        && data[0] & 0x80 != 0
        && data[2] == HS_CLIENT_HELLO
}

/// Challenge of an SSLv2 ClientHello, right-aligned into 32 bytes.
fn sslv2_client_random(data: &[u8]) -> Option<[u8; 32]> {
    let field = |at: usize| {
        data.get(at..at + 2)
            .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
    };
    let cipher_specs_len = field(5)?;
    let session_id_len = field(7)?;
    let challenge_len = field(9)?;
    if challenge_len == 0 || challenge_len > 32 {
        return None;
    }

    let start = 11 + cipher_specs_len + session_id_len;
    let challenge = data.get(start..start + challenge_len)?;
    let mut random = [0u8; 32];
    random[32 - challenge_len..].copy_from_slice(challenge);
    Some(random)
}
