//! Error types for the meshsync-reduce subsystem

/// Result alias for chunking, packing and deduplication operations
pub type ReduceResult<T> = Result<T, ReduceError>;

/// All errors that can occur while chunking, packing or deduplicating data
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// An algorithm name in the configuration is not known
    #[error("Unsupported {kind} algorithm: {name}")]
    UnsupportedAlgorithm {
        /// Which algorithm family was being parsed (digest, fingerprint, ...)
        kind: &'static str,
        /// The rejected name
        name: String,
    },
    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A write was attempted on a container that was already sealed
    #[error("Container {id} is sealed and cannot accept more chunks")]
    ContainerSealed {
        /// Hex id of the sealed container
        id: String,
    },
    /// A container could not be parsed
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),
    /// A digest string could not be decoded
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch, data may be corrupted or tampered
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// Encryption is enabled but no master key was provided
    #[error("Missing encryption key: encryption is enabled but no master key was set")]
    MissingKey,
    /// I/O error, including failures of the input stream while chunking
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
