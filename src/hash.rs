// src/hash.rs

//! Streaming digests for artifact verification and web-root validators
//!
//! Repository indexes name the digest algorithm of every artifact, so the
//! algorithm is selected by name at runtime:
//! - **SHA-256**: the default for packages and signed indexes
//! - **SHA-1** / **MD5**: still published by older indexes
//! - **XXH128**: non-cryptographic, used for weak HTTP validators only
//!
//! Comparison against an expected digest is always case-insensitive.

use crate::error::{Error, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha1,
    Md5,
    /// Change detection only, never a trust decision
    Xxh128,
}

impl HashAlgorithm {
    /// Name as written in repository indexes
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "md5" => Ok(Self::Md5),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// A computed digest, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl Hash {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Case-insensitive comparison against a hex digest
    pub fn matches(&self, expected: &str) -> bool {
        self.value.eq_ignore_ascii_case(expected.trim())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Incremental digest over any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha1(Sha1),
    Md5(Md5),
    // xxh3_128 is one-shot here, so input is buffered
    Xxh128(Vec<u8>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Vec::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha1(hasher) => hasher.update(data),
            HasherState::Md5(hasher) => hasher.update(data),
            HasherState::Xxh128(buffer) => buffer.extend_from_slice(data),
        }
    }

    pub fn finalize(self) -> Hash {
        let value = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha1(hasher) => hex::encode(hasher.finalize()),
            HasherState::Md5(hasher) => hex::encode(hasher.finalize()),
            HasherState::Xxh128(buffer) => format!("{:032x}", xxh3_128(&buffer)),
        };
        Hash {
            algorithm: self.algorithm,
            value,
        }
    }
}

fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Stream a file through the hasher
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<Hash> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data).value
}

pub fn xxh128(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Xxh128, data).value
}

// =============================================================================
// File verification
// =============================================================================

/// A file paired with a digest algorithm chosen by name
///
/// Construction fails for unknown algorithm names, which is a configuration
/// problem. [`FileHasher::matches`] never fails: a missing or unreadable file
/// is simply a mismatch.
#[derive(Debug, Clone)]
pub struct FileHasher {
    algorithm: HashAlgorithm,
    path: PathBuf,
}

impl FileHasher {
    /// Select the algorithm by name (e.g. `"sha256"`)
    pub fn new(algorithm: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let algorithm = algorithm.parse::<HashAlgorithm>().inspect_err(|e| {
            warn!("Rejecting digest configuration: {}", e);
        })?;
        Ok(Self {
            algorithm,
            path: path.into(),
        })
    }

    /// Digest of the file's current contents
    pub fn hash(&self) -> io::Result<Hash> {
        hash_file(self.algorithm, &self.path)
    }

    pub fn matches(&self, expected: &str) -> bool {
        match self.hash() {
            Ok(actual) => actual.matches(expected),
            Err(e) => {
                debug!("Cannot hash {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Like [`FileHasher::matches`], but a mismatch carries both digests
    pub fn verify(&self, expected: &str) -> Result<Hash> {
        let actual = self
            .hash()
            .map_err(|e| Error::from_io(&self.path.display().to_string(), e))?;
        if actual.matches(expected) {
            Ok(actual)
        } else {
            Err(Error::VerificationFailed {
                algorithm: self.algorithm.to_string(),
                expected: expected.trim().to_ascii_lowercase(),
                actual: actual.value,
            })
        }
    }
}
