//! AES-256-GCM and ChaCha20-Poly1305 sealing of container payloads with HKDF key derivation

use crate::error::{ReduceError, ReduceResult};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;

/// 256-bit key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated with AES-NI
    #[default]
    #[serde(rename = "aes-gcm-256")]
    AesGcm256,
    /// ChaCha20-Poly1305, fast on hardware without AES instructions
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Tag byte leading an encrypted payload
    pub fn tag(&self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm256 => 1,
            EncryptionAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    fn from_tag(tag: u8) -> ReduceResult<Self> {
        match tag {
            1 => Ok(EncryptionAlgorithm::AesGcm256),
            2 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            other => Err(ReduceError::CorruptContainer(format!(
                "unknown cipher tag {other}"
            ))),
        }
    }
}

/// Encrypted payload: `tag(1) | nonce(12) | ciphertext+tag(16)`
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    /// Cipher used
    pub algo: EncryptionAlgorithm,
    /// Random nonce
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the AEAD tag appended
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Serialize to the on-storage layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + self.ciphertext.len());
        out.push(self.algo.tag());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the on-storage layout
    pub fn from_bytes(data: &[u8]) -> ReduceResult<Self> {
        if data.len() < 1 + NONCE_LEN {
            return Err(ReduceError::CorruptContainer(
                "encrypted payload shorter than its header".into(),
            ));
        }
        let algo = EncryptionAlgorithm::from_tag(data[0])?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[1..1 + NONCE_LEN]);
        Ok(Self {
            algo,
            nonce,
            ciphertext: data[1 + NONCE_LEN..].to_vec(),
        })
    }
}

/// Derive a per-container key from the master key and the container id
pub fn derive_container_key(master: &EncryptionKey, container_id: &[u8]) -> ReduceResult<EncryptionKey> {
    let hk = Hkdf::<Sha256>::new(None, &master.0);
    let mut okm = [0u8; 32];
    let mut info = Vec::with_capacity(19 + container_id.len());
    info.extend_from_slice(b"meshsync-multichunk");
    info.extend_from_slice(container_id);
    hk.expand(&info, &mut okm)
        .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
    Ok(EncryptionKey(okm))
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Encrypt with a fresh random nonce
pub fn encrypt(
    plaintext: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> ReduceResult<EncryptedPayload> {
    let nonce = random_nonce();
    let ciphertext = match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
        }
    };
    Ok(EncryptedPayload {
        algo,
        nonce,
        ciphertext,
    })
}

/// Decrypt; `DecryptionAuthFailed` if the payload was tampered with or the key is wrong
pub fn decrypt(payload: &EncryptedPayload, key: &EncryptionKey) -> ReduceResult<Vec<u8>> {
    match payload.algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&payload.nonce), payload.ciphertext.as_ref())
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(
                    chacha20poly1305::Nonce::from_slice(&payload.nonce),
                    payload.ciphertext.as_ref(),
                )
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey([42u8; 32])
    }

    #[test]
    fn both_ciphers_roundtrip_through_bytes() {
        for algo in [EncryptionAlgorithm::AesGcm256, EncryptionAlgorithm::ChaCha20Poly1305] {
            let enc = encrypt(b"container payload", &test_key(), algo).unwrap();
            let parsed = EncryptedPayload::from_bytes(&enc.to_bytes()).unwrap();
            assert_eq!(parsed.algo, algo);
            assert_eq!(decrypt(&parsed, &test_key()).unwrap(), b"container payload");
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut enc = encrypt(b"secret", &test_key(), EncryptionAlgorithm::AesGcm256).unwrap();
        enc.ciphertext[0] ^= 0xff;
        assert!(matches!(
            decrypt(&enc, &test_key()),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let enc = encrypt(b"secret", &test_key(), EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        assert!(matches!(
            decrypt(&enc, &EncryptionKey([7u8; 32])),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn container_keys_differ_per_container() {
        let master = test_key();
        let k1 = derive_container_key(&master, &[1u8; 16]).unwrap();
        let k2 = derive_container_key(&master, &[2u8; 16]).unwrap();
        assert_ne!(k1.0, k2.0);
        assert_eq!(k1.0, derive_container_key(&master, &[1u8; 16]).unwrap().0);
    }

    #[test]
    fn short_or_unknown_payloads_are_corrupt() {
        assert!(matches!(
            EncryptedPayload::from_bytes(&[1, 2, 3]),
            Err(ReduceError::CorruptContainer(_))
        ));
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&[0u8; 40]);
        assert!(EncryptedPayload::from_bytes(&bytes).is_err());
    }

    #[test]
    fn algorithm_names_in_config() {
        let json = serde_json::to_string(&EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        assert_eq!(json, "\"chacha20-poly1305\"");
    }
}
