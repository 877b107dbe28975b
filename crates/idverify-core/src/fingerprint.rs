//! Deterministic identity fingerprints.
//!
//! A fingerprint stands in for the raw `(name, document hash)` pair; only the fingerprint
//! ever leaves the client. The preimage is encoded with a versioned, length-delimited
//! layout before hashing so that no two distinct pairs share an encoding:
//!
//! ```text
//! "idverify/fingerprint" | version:u8 | len(name):u64be | name | len(doc):u64be | doc
//! ```

use crate::error::IdentityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain separation tag for the fingerprint preimage.
pub const FINGERPRINT_DOMAIN: &[u8] = b"idverify/fingerprint";

/// Current preimage layout version. Changing the layout requires bumping this.
pub const FINGERPRINT_VERSION: u8 = 1;

pub const FINGERPRINT_LEN: usize = 32;

/// Opaque 32-byte identity fingerprint, rendered as `0x` + 64 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityFingerprint([u8; FINGERPRINT_LEN]);

impl IdentityFingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// First ten characters, as shown in confirmation messages.
    pub fn short(&self) -> String {
        let full = self.to_hex();
        format!("{}...", &full[..10])
    }

    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let decoded = hex::decode(digits)
            .map_err(|e| IdentityError::InvalidInput(format!("fingerprint '{raw}': {e}")))?;
        let bytes: [u8; FINGERPRINT_LEN] = decoded.try_into().map_err(|_| {
            IdentityError::InvalidInput(format!(
                "fingerprint '{raw}' must be {FINGERPRINT_LEN} bytes"
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityFingerprint({})", self.to_hex())
    }
}

impl FromStr for IdentityFingerprint {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdentityFingerprint {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityFingerprint> for String {
    fn from(value: IdentityFingerprint) -> Self {
        value.to_hex()
    }
}

/// A string that is non-empty after trimming. Holds the trimmed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    pub fn new(field: &str, value: &str) -> Result<Self, IdentityError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::InvalidInput(format!("{field} must not be empty")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Pure fingerprint derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintDeriver;

impl FingerprintDeriver {
    pub fn derive(
        &self,
        name: &NonEmptyString,
        document_hash: &NonEmptyString,
    ) -> IdentityFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&[FINGERPRINT_VERSION]);
        for field in [name.as_str(), document_hash.as_str()] {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        IdentityFingerprint(*hasher.finalize().as_bytes())
    }
}

/// Validate raw form input and derive its fingerprint.
pub fn derive_fingerprint(
    name: &str,
    document_hash: &str,
) -> Result<IdentityFingerprint, IdentityError> {
    let name = NonEmptyString::new("name", name)?;
    let document_hash = NonEmptyString::new("document hash", document_hash)?;
    Ok(FingerprintDeriver.derive(&name, &document_hash))
}
