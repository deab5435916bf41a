//! Content digests used as chunk identities.
//!
//! A [`Hash`] is the SHA-1 digest of a chunk's bytes. Its compact binary form
//! is the raw 20 bytes, its textual form is `sha1-` followed by the lowercase
//! hex digest.

use std::array::TryFromSliceError;
use std::fmt;
use std::str::FromStr;

use digest::Digest;
use hex::{FromHex, FromHexError};
use sha1::Sha1;

/// Length of a digest in bytes.
pub const HASH_LEN: usize = 20;

/// Prefix of the textual representation.
pub const HASH_PROTOCOL: &str = "sha1";

pub type RawHash = [u8; HASH_LEN];

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash {
    pub raw: RawHash,
}

impl Hash {
    /// The all-zero hash. Stands in for "no root".
    pub const EMPTY: Hash = Hash { raw: [0; HASH_LEN] };

    pub const fn new(raw: RawHash) -> Self {
        Hash { raw }
    }

    /// Digests `data`.
    pub fn of(data: &[u8]) -> Self {
        Hash {
            raw: Sha1::digest(data).into(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TryFromSliceError> {
        Ok(Hash {
            raw: bytes.try_into()?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw == [0; HASH_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.raw)
    }

    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        Ok(Hash {
            raw: RawHash::from_hex(hex)?,
        })
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_PROTOCOL}-{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HashError {
    BadProtocol,
    BadHex(FromHexError),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadProtocol => write!(f, "expected a `{HASH_PROTOCOL}-` prefix"),
            Self::BadHex(e) => write!(f, "bad digest: {e}"),
        }
    }
}

impl std::error::Error for HashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadProtocol => None,
            Self::BadHex(e) => Some(e),
        }
    }
}

impl From<FromHexError> for HashError {
    fn from(value: FromHexError) -> Self {
        HashError::BadHex(value)
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(digest) = s
            .strip_prefix(HASH_PROTOCOL)
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return Err(HashError::BadProtocol);
        };
        Ok(Hash::from_hex(digest)?)
    }
}

impl From<RawHash> for Hash {
    fn from(raw: RawHash) -> Self {
        Hash { raw }
    }
}
