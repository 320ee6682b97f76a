//! Content digests with pluggable algorithms.

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Hash algorithm used for a [`Digest`].
///
/// SHA-256 is what repositories publish for upstream verification. BLAKE3 is
/// accepted for repositories that publish it and is used internally for lock
/// file names, where speed matters more than interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DigestAlgorithm {
    /// SHA-256.
    #[default]
    Sha256,
    /// BLAKE3.
    Blake3,
}

impl DigestAlgorithm {
    /// Textual prefix (`sha256`, `blake3`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Start a streaming hasher for this algorithm.
    pub fn hasher(self) -> DigestHasher {
        match self {
            Self::Sha256 => DigestHasher::Sha256(sha2::Sha256::new()),
            Self::Blake3 => DigestHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(ParseError::Digest {
                input: s.to_string(),
                reason: "unknown algorithm".to_string(),
            }),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated content digest: algorithm plus 64 lowercase hex characters.
///
/// Textual form is `algorithm:hex`. A bare 64-character hex string is read as
/// SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Create a digest, validating the hex portion.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Digest`] if `hex` is not exactly 64 hex characters.
    pub fn new(algorithm: DigestAlgorithm, hex: &str) -> Result<Self, ParseError> {
        if hex.len() != 64 {
            return Err(ParseError::Digest {
                input: hex.to_string(),
                reason: format!("expected 64 hex characters, got {}", hex.len()),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::Digest {
                input: hex.to_string(),
                reason: "contains non-hex characters".to_string(),
            });
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Parse `algorithm:hex` or bare hex (SHA-256).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Digest`] for unknown algorithms or malformed hex.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        match s.split_once(':') {
            Some((algo, hex)) => Self::new(algo.parse()?, hex),
            None => Self::new(DigestAlgorithm::Sha256, s),
        }
    }

    /// Hash an in-memory buffer.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// SHA-256 of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(DigestAlgorithm::Sha256, data)
    }

    /// BLAKE3 of `data`.
    pub fn blake3(data: &[u8]) -> Self {
        Self::compute(DigestAlgorithm::Blake3, data)
    }

    /// The algorithm.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The lowercase hex string without prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Incremental hasher producing a [`Digest`].
pub enum DigestHasher {
    /// SHA-256 state.
    Sha256(sha2::Sha256),
    /// BLAKE3 state (boxed, it is large).
    Blake3(Box<blake3::Hasher>),
}

impl DigestHasher {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and produce the digest.
    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Self::Blake3(h) => Digest {
                algorithm: DigestAlgorithm::Blake3,
                hex: h.finalize().to_hex().to_string(),
            },
        }
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algo = match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Blake3(_) => DigestAlgorithm::Blake3,
        };
        f.debug_struct("DigestHasher")
            .field("algorithm", &algo)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn sha256_known_value() {
        let d = Digest::sha256(b"hello world");
        assert_eq!(d.hex(), HELLO_SHA256);
        assert_eq!(d.to_string(), format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn bare_hex_defaults_to_sha256() {
        let d = Digest::parse(&HELLO_SHA256.to_uppercase()).unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(d.hex(), HELLO_SHA256);
    }

    #[test]
    fn blake3_deterministic() {
        let h1 = Digest::blake3(b"test data");
        let h2 = Digest::blake3(b"test data");
        assert_eq!(h1, h2);
        assert_eq!(h1.hex().len(), 64);
        assert_ne!(h1, Digest::blake3(b"other data"));
        assert_eq!(Digest::parse(&h1.to_string()).unwrap(), h1);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut hasher = DigestAlgorithm::Sha256.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Digest::sha256(b"hello world"));
    }

    #[test]
    fn rejects_bad_digests() {
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&format!("md5:{HELLO_SHA256}")).is_err());
        assert!(Digest::parse(&"z".repeat(64)).is_err());
    }

    #[test]
    fn serde_uses_prefixed_string() {
        let d = Digest::sha256(b"hello world");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO_SHA256}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
