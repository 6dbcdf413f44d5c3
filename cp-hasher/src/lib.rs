//! Deterministic SHA-256 hashing of files and strings, in the canonical
//! `sha256:<64hex>` encoding used throughout the control plane.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 64 * 1024;
const PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("io error hashing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed hash string: {0}")]
    Malformed(String),
}

/// The canonical `sha256:<64hex>` string form. Validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    /// Parse and validate a canonical hash string.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        if !is_valid_hash(s) {
            return Err(HashError::Malformed(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_digest(digest: sha2::digest::Output<Sha256>) -> Self {
        let mut s = String::with_capacity(PREFIX.len() + HEX_LEN);
        s.push_str(PREFIX);
        for byte in digest {
            s.push_str(&format!("{:02x}", byte));
        }
        Self(s)
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true iff `s` is exactly `"sha256:"` followed by 64 lowercase hex digits.
pub fn is_valid_hash(s: &str) -> bool {
    match s.strip_prefix(PREFIX) {
        Some(rest) => rest.len() == HEX_LEN && rest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

/// Hash a UTF-8 string.
pub fn hash_string(s: &str) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    Hash::from_digest(hasher.finalize())
}

/// Hash raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash::from_digest(hasher.finalize())
}

/// Stream a file in 64 KiB chunks and hash its contents.
pub fn hash_file(path: &Path) -> Result<Hash, HashError> {
    let mut file = File::open(path).map_err(|e| HashError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| HashError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Hash::from_digest(hasher.finalize()))
}
