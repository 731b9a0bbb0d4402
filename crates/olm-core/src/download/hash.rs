//! Content hash parsing and streaming file verification.
//!
//! Expected hashes come from update metadata in one of three forms:
//! `sha256:<hex>`, `md5:<hex>`, or bare hex whose length picks the algorithm.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Buffer size for reading files during hashing.
const BUFFER_SIZE: usize = 65536; // 64 KB

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// 128-bit MD5, as published by legacy update servers.
    Md5,
    /// SHA-256, as published by GitHub release assets.
    Sha256,
}

impl HashAlgorithm {
    const fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

/// An expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    hex: String,
}

impl ContentHash {
    /// Parse `sha256:<hex>`, `md5:<hex>` or bare hex.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (algorithm, hex) = match value.split_once(':') {
            Some((prefix, hex)) => {
                let algorithm = match prefix.to_ascii_lowercase().as_str() {
                    "md5" => HashAlgorithm::Md5,
                    "sha256" => HashAlgorithm::Sha256,
                    other => {
                        return Err(CoreError::InvalidDigest(format!(
                            "unsupported algorithm '{other}'"
                        )));
                    }
                };
                (algorithm, hex)
            }
            None => match value.len() {
                32 => (HashAlgorithm::Md5, value),
                64 => (HashAlgorithm::Sha256, value),
                _ => return Err(CoreError::InvalidDigest(value.to_string())),
            },
        };

        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidDigest(value.to_string()));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Parse an optional field where an empty string means "no hash".
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>> {
        match value.map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => Self::parse(value).map(Some),
        }
    }

    /// Algorithm of this digest.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Hash `path` and compare.
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        info!("Verifying {} checksum for: {}", self.algorithm.label(), path.display());

        let actual = compute_file_hash(path, self.algorithm)?;
        if actual != self.hex {
            return Err(CoreError::HashMismatch {
                expected: self.hex.clone(),
                actual,
            });
        }

        info!("Checksum verification successful");
        Ok(())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.label(), self.hex)
    }
}

/// Compute the hex digest of a file.
pub fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    debug!("Computing {} for: {}", algorithm.label(), path.display());

    let file = File::open(path).map_err(|e| CoreError::io("open", path, &e))?;
    let reader = BufReader::with_capacity(BUFFER_SIZE, file);

    match algorithm {
        HashAlgorithm::Md5 => digest_reader::<Md5>(reader, path),
        HashAlgorithm::Sha256 => digest_reader::<Sha256>(reader, path),
    }
}

fn digest_reader<D: Digest>(mut reader: impl Read, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| CoreError::io("read", path, &e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
