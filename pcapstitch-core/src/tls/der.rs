//! Minimal DER reader.
//!
//! A forward-only cursor over one ASN.1 SEQUENCE, enough to walk PKCS#1 and
//! PKCS#8 private keys and to pull the RSA modulus out of an X.509
//! certificate. Nothing is validated beyond what the walk needs.

use thiserror::Error;

/// SEQUENCE identifier.
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
/// `[0]` explicit context tag (certificate version).
pub const TAG_CONTEXT_0: u8 = 0xa0;

/// Errors from DER parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerError {
    #[error("Expected tag 0x{expected:02x} at offset {offset}, found 0x{found:02x}")]
    UnexpectedTag {
        expected: u8,
        found: u8,
        offset: usize,
    },

    #[error("DER data truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("Unsupported DER length encoding ({0} length bytes)")]
    UnsupportedLength(usize),
}

/// Sequential cursor over a DER-encoded SEQUENCE.
#[derive(Debug, Clone)]
pub struct DerReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DerReader<'a> {
    /// Start reading at `offset`, which must hold a SEQUENCE identifier.
    pub fn new(data: &'a [u8], offset: usize) -> Result<Self, DerError> {
        let found = *data.get(offset).ok_or(DerError::Truncated { offset })?;
        if found != TAG_SEQUENCE {
            return Err(DerError::UnexpectedTag {
                expected: TAG_SEQUENCE,
                found,
                offset,
            });
        }
        Ok(Self { data, offset })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Whether the cursor has reached the end of the buffer.
    pub fn is_at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Identifier byte of the object under the cursor.
    pub fn tag(&self) -> Result<u8, DerError> {
        self.byte(self.offset)
    }

    /// Content length of the object under the cursor.
    pub fn length(&self) -> Result<usize, DerError> {
        let first = self.byte(self.offset + 1)?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first & 0x7f));
        }

        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return Err(DerError::UnsupportedLength(count));
        }
        let start = self.offset + 2;
        let bytes = self
            .data
            .get(start..start + count)
            .ok_or(DerError::Truncated { offset: start })?;
        Ok(bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b)))
    }

    /// Number of bytes used to encode the length of the object under the cursor.
    pub fn length_prefix_size(&self) -> Result<usize, DerError> {
        let first = self.byte(self.offset + 1)?;
        if first & 0x80 == 0 {
            Ok(1)
        } else {
            Ok(1 + usize::from(first & 0x7f))
        }
    }

    /// Advance past the object under the cursor.
    pub fn skip_object(&mut self) -> Result<(), DerError> {
        let end = self.content_start()? + self.length()?;
        if end > self.data.len() {
            return Err(DerError::Truncated { offset: end });
        }
        self.offset = end;
        Ok(())
    }

    /// Descend into the constructed object under the cursor.
    pub fn step_into(&mut self) -> Result<(), DerError> {
        self.offset = self.content_start()?;
        Ok(())
    }

    /// Return the content of the object under the cursor and advance past it.
    ///
    /// With `strip_leading_zeros`, leading 0x00 bytes (INTEGER sign padding)
    /// are removed from the returned slice.
    pub fn extract_object(&mut self, strip_leading_zeros: bool) -> Result<&'a [u8], DerError> {
        let start = self.content_start()?;
        let end = start + self.length()?;
        let mut content = self
            .data
            .get(start..end)
            .ok_or(DerError::Truncated { offset: end })?;
        self.offset = end;

        if strip_leading_zeros {
            while let [0x00, rest @ ..] = content {
                content = rest;
            }
        }
        Ok(content)
    }

    /// Like [`extract_object`](Self::extract_object) but checks the tag first.
    pub fn extract_tagged(
        &mut self,
        expected: u8,
        strip_leading_zeros: bool,
    ) -> Result<&'a [u8], DerError> {
        self.expect_tag(expected)?;
        self.extract_object(strip_leading_zeros)
    }

    fn expect_tag(&self, expected: u8) -> Result<(), DerError> {
        let found = self.tag()?;
        if found != expected {
            return Err(DerError::UnexpectedTag {
                expected,
                found,
                offset: self.offset,
            });
        }
        Ok(())
    }

    fn content_start(&self) -> Result<usize, DerError> {
        Ok(self.offset + 1 + self.length_prefix_size()?)
    }

    fn byte(&self, offset: usize) -> Result<u8, DerError> {
        self.data
            .get(offset)
            .copied()
            .ok_or(DerError::Truncated { offset })
    }
}

// ============================================================================
// RSA structures
// ============================================================================

/// Components of a PKCS#1 `RSAPrivateKey`, big-endian without sign padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPrivateKeyParts<'a> {
    pub modulus: &'a [u8],
    pub public_exponent: &'a [u8],
    pub private_exponent: &'a [u8],
    pub prime1: &'a [u8],
    pub prime2: &'a [u8],
}

/// Walk a PKCS#1 `RSAPrivateKey` structure.
pub fn parse_rsa_private_key(der: &[u8]) -> Result<RsaPrivateKeyParts<'_>, DerError> {
    let mut reader = DerReader::new(der, 0)?;
    reader.step_into()?;
    reader.skip_object()?; // version

    Ok(RsaPrivateKeyParts {
        modulus: reader.extract_tagged(TAG_INTEGER, true)?,
        public_exponent: reader.extract_tagged(TAG_INTEGER, true)?,
        private_exponent: reader.extract_tagged(TAG_INTEGER, true)?,
        prime1: reader.extract_tagged(TAG_INTEGER, true)?,
        prime2: reader.extract_tagged(TAG_INTEGER, true)?,
    })
}

/// Unwrap a PKCS#8 `PrivateKeyInfo` to the inner PKCS#1 key bytes.
pub fn unwrap_pkcs8(der: &[u8]) -> Result<&[u8], DerError> {
    let mut reader = DerReader::new(der, 0)?;
    reader.step_into()?;
    reader.skip_object()?; // version
    reader.skip_object()?; // privateKeyAlgorithm
    reader.extract_tagged(TAG_OCTET_STRING, false)
}

/// Extract the RSA modulus from a DER-encoded X.509 certificate.
pub fn rsa_modulus_from_certificate(cert: &[u8]) -> Result<&[u8], DerError> {
    let mut reader = DerReader::new(cert, 0)?;
    reader.step_into()?; // Certificate
    reader.step_into()?; // tbsCertificate

    if reader.tag()? == TAG_CONTEXT_0 {
        reader.skip_object()?; // version
    }
    reader.skip_object()?; // serialNumber
    reader.skip_object()?; // signature
    reader.skip_object()?; // issuer
    reader.skip_object()?; // validity
    reader.skip_object()?; // subject

    reader.step_into()?; // subjectPublicKeyInfo
    reader.skip_object()?; // algorithm
    let bits = reader.extract_tagged(TAG_BIT_STRING, false)?;

    // First BIT STRING byte counts unused bits
    let key = bits.get(1..).ok_or(DerError::Truncated {
        offset: reader.offset(),
    })?;
    let mut key_reader = DerReader::new(key, 0)?;
    key_reader.step_into()?;
    key_reader.extract_tagged(TAG_INTEGER, true)
}
