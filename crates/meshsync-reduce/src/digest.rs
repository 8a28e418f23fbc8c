//! Content digests: the identity of chunks and files

use crate::error::{ReduceError, ReduceResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte cryptographic digest. Two chunks with equal digests are the same chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDigest(pub [u8; 32]);

impl ChunkDigest {
    /// Return the digest as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> ReduceResult<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ReduceError::InvalidDigest(s.to_string()));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ReduceError::InvalidDigest(s.to_string()))?;
        }
        Ok(Self(out))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix used in log lines
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ChunkDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChunkDigest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Cryptographic digest used for chunk and whole-file identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    /// BLAKE3, fast on every platform
    #[default]
    Blake3,
    /// SHA-256
    Sha256,
}

impl DigestAlgorithm {
    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Blake3 => "blake3",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// Start an incremental digest
    pub fn hasher(&self) -> DigestHasher {
        match self {
            DigestAlgorithm::Blake3 => DigestHasher::Blake3(Box::new(blake3::Hasher::new())),
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
        }
    }

    /// Digest a complete buffer
    pub fn digest(&self, data: &[u8]) -> ChunkDigest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(DigestAlgorithm::Blake3),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(ReduceError::UnsupportedAlgorithm {
                kind: "digest",
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for DigestAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for DigestAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest state for one of the supported algorithms
#[derive(Clone)]
pub enum DigestHasher {
    /// BLAKE3 state
    Blake3(Box<blake3::Hasher>),
    /// SHA-256 state
    Sha256(Sha256),
}

impl DigestHasher {
    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        match self {
            DigestHasher::Blake3(h) => {
                h.update(data);
            }
            DigestHasher::Sha256(h) => h.update(data),
        }
    }

    /// Consume the state and produce the digest
    pub fn finalize(self) -> ChunkDigest {
        match self {
            DigestHasher::Blake3(h) => ChunkDigest(*h.finalize().as_bytes()),
            DigestHasher::Sha256(h) => ChunkDigest(h.finalize().into()),
        }
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestHasher::Blake3(_) => f.write_str("DigestHasher(blake3)"),
            DigestHasher::Sha256(_) => f.write_str("DigestHasher(sha256)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        for algo in [DigestAlgorithm::Blake3, DigestAlgorithm::Sha256] {
            assert_eq!(algo.digest(b"hello world"), algo.digest(b"hello world"));
            assert_ne!(algo.digest(b"hello"), algo.digest(b"world"));
        }
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = DigestAlgorithm::Sha256.hasher();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), DigestAlgorithm::Sha256.digest(b"hello world"));
    }

    #[test]
    fn sha256_known_vector() {
        let d = DigestAlgorithm::Sha256.digest(b"");
        assert_eq!(
            d.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "md5".parse::<DigestAlgorithm>().unwrap_err();
        assert!(matches!(err, ReduceError::UnsupportedAlgorithm { kind: "digest", .. }));
        assert_eq!("SHA256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(ChunkDigest::from_hex("abc").is_err());
        assert!(ChunkDigest::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn digest_serializes_as_hex() {
        let d = DigestAlgorithm::Blake3.digest(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: ChunkDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    proptest! {
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
            let d = ChunkDigest(bytes);
            prop_assert_eq!(ChunkDigest::from_hex(&d.to_hex()).unwrap(), d);
        }
    }
}
