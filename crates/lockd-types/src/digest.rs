//! Canonical CBOR encoding and SHA-256 digests for integrity hashes and PINs.

use serde::Serialize;
use serde_cbor::{ser::Write as CborWrite, value::Value as CborValue};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Prefix for rendered digests (e.g. `sha256:deadbeef`).
pub const DIGEST_PREFIX: &str = "sha256:";

/// Serialize a value into canonical CBOR bytes (map keys sorted, self-described).
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut buf = Vec::with_capacity(256);
    write_canonical_cbor(value, &mut buf)?;
    Ok(buf)
}

pub fn write_canonical_cbor<T: Serialize, W>(value: &T, writer: W) -> Result<(), serde_cbor::Error>
where
    W: CborWrite,
{
    let canonical_value: CborValue = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(writer);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)
}

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Digest(arr)
    }

    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        Ok(Self::of_bytes(&to_canonical_cbor(value)?))
    }

    /// Order-independent digest of a set of strings. Used for the installed-apps
    /// and system-properties integrity hashes so that enumeration order from the
    /// platform never changes the result.
    pub fn of_sorted_strings<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut values: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
        values.sort();
        values.dedup();
        // A Vec<String> always encodes.
        Self::of_cbor(&values).unwrap_or_else(|_| Self::of_bytes(values.join("\n").as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("{DIGEST_PREFIX}{}", hex::encode(self.0))
    }

    pub fn from_hex_str(s: &str) -> Result<Self, DigestParseError> {
        let rest = s
            .strip_prefix(DIGEST_PREFIX)
            .ok_or(DigestParseError::MissingPrefix)?;
        if rest.len() != 64 {
            return Err(DigestParseError::InvalidLength(rest.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf).map_err(DigestParseError::InvalidHex)?;
        Ok(Digest(buf))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Digest(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    #[error("digest string missing '{DIGEST_PREFIX}' prefix")]
    MissingPrefix,
    #[error("digest hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
