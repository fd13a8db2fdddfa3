//! Tarball integrity verification.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::error::{FetchError, Result};

/// Expected digest of a downloaded tarball, as published in registry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedDigest {
    /// SRI string, possibly several space-separated hashes
    Sri(String),
    /// Legacy hex SHA-1
    Shasum(String),
}

impl ExpectedDigest {
    /// Prefer SRI over the legacy shasum. `None` when neither is published.
    pub fn from_dist(integrity: Option<&str>, shasum: Option<&str>) -> Option<Self> {
        integrity
            .filter(|s| !s.trim().is_empty())
            .map(|s| ExpectedDigest::Sri(s.trim().to_string()))
            .or_else(|| {
                shasum
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| ExpectedDigest::Shasum(s.trim().to_string()))
            })
    }

    /// Check `data` against this digest.
    pub fn verify(&self, package: &str, data: &[u8]) -> Result<()> {
        let (ok, expected, actual) = match self {
            ExpectedDigest::Sri(sri) => (matches_sri(data, sri), sri, sha512_sri(data)),
            ExpectedDigest::Shasum(hex_sum) => {
                let actual = sha1_hex(data);
                (actual.eq_ignore_ascii_case(hex_sum), hex_sum, actual)
            }
        };

        if !ok {
            return Err(FetchError::IntegrityMismatch {
                package: package.to_string(),
                expected: expected.clone(),
                actual,
            });
        }

        debug!("Integrity verified for {}", package);
        Ok(())
    }
}

/// Any supported hash in the SRI string matching is enough.
fn matches_sri(data: &[u8], integrity: &str) -> bool {
    integrity.split_whitespace().any(|hash_str| {
        let Some((algo, expected)) = hash_str.split_once('-') else {
            return false;
        };
        let computed = match algo {
            "sha1" => BASE64.encode(Sha1::digest(data)),
            "sha256" => BASE64.encode(Sha256::digest(data)),
            "sha384" => BASE64.encode(Sha384::digest(data)),
            "sha512" => BASE64.encode(Sha512::digest(data)),
            _ => return false,
        };
        computed == expected
    })
}

pub fn sha512_sri(data: &[u8]) -> String {
    format!("sha512-{}", BASE64.encode(Sha512::digest(data)))
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
