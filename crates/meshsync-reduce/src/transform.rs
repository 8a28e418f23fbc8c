//! Transform chain wrapped around a container payload: compress, then optionally encrypt.

use crate::compression::{compress, decompress, CompressionAlgorithm};
use crate::encryption::{
    decrypt, derive_container_key, encrypt, EncryptedPayload, EncryptionAlgorithm, EncryptionKey,
};
use crate::error::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};

/// Which transforms to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Compression stage
    pub compression: CompressionAlgorithm,
    /// Encryption stage; `None` stores the compressed payload in clear
    pub encryption: Option<EncryptionAlgorithm>,
}

/// Configured transform chain, holding the master key when encryption is on
#[derive(Debug, Clone)]
pub struct Transformer {
    config: TransformConfig,
    master_key: Option<EncryptionKey>,
}

impl Transformer {
    /// Build the chain; encryption without a key fails with `MissingKey`
    pub fn new(config: TransformConfig, master_key: Option<EncryptionKey>) -> ReduceResult<Self> {
        if config.encryption.is_some() && master_key.is_none() {
            return Err(ReduceError::MissingKey);
        }
        Ok(Self { config, master_key })
    }

    /// Chain that stores payloads unchanged
    pub fn identity() -> Self {
        Self {
            config: TransformConfig {
                compression: CompressionAlgorithm::None,
                encryption: None,
            },
            master_key: None,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    fn container_key(&self, container_id: &[u8]) -> ReduceResult<EncryptionKey> {
        let master = self.master_key.as_ref().ok_or(ReduceError::MissingKey)?;
        derive_container_key(master, container_id)
    }

    /// Transform a sealed payload for storage
    pub fn apply(&self, container_id: &[u8], payload: &[u8]) -> ReduceResult<Vec<u8>> {
        let compressed = compress(payload, self.config.compression)?;
        match self.config.encryption {
            None => Ok(compressed),
            Some(algo) => {
                let key = self.container_key(container_id)?;
                Ok(encrypt(&compressed, &key, algo)?.to_bytes())
            }
        }
    }

    /// Reverse [`Transformer::apply`]
    pub fn reverse(&self, container_id: &[u8], stored: &[u8]) -> ReduceResult<Vec<u8>> {
        let compressed = match self.config.encryption {
            None => stored.to_vec(),
            Some(algo) => {
                let payload = EncryptedPayload::from_bytes(stored)?;
                if payload.algo != algo {
                    return Err(ReduceError::CorruptContainer(format!(
                        "container sealed with {:?}, configured {:?}",
                        payload.algo, algo
                    )));
                }
                let key = self.container_key(container_id)?;
                decrypt(&payload, &key)?
            }
        };
        decompress(&compressed, self.config.compression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_requires_key() {
        let cfg = TransformConfig {
            compression: CompressionAlgorithm::Lz4,
            encryption: Some(EncryptionAlgorithm::AesGcm256),
        };
        assert!(matches!(Transformer::new(cfg, None), Err(ReduceError::MissingKey)));
    }

    #[test]
    fn full_chain_roundtrips_and_binds_to_container() {
        let cfg = TransformConfig {
            compression: CompressionAlgorithm::Zstd { level: 3 },
            encryption: Some(EncryptionAlgorithm::ChaCha20Poly1305),
        };
        let t = Transformer::new(cfg, Some(EncryptionKey([3u8; 32]))).unwrap();
        let payload = b"abc".repeat(1000);
        let stored = t.apply(b"container-1", &payload).unwrap();
        assert_eq!(t.reverse(b"container-1", &stored).unwrap(), payload);
        assert!(matches!(
            t.reverse(b"container-2", &stored),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn identity_is_passthrough() {
        let t = Transformer::identity();
        assert_eq!(t.apply(b"id", b"plain").unwrap(), b"plain");
    }
}
