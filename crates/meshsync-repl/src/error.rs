//! Error types for the replication subsystem.

use meshsync_reduce::ReduceError;
use thiserror::Error;

/// Result alias for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Replica identifier is empty or contains characters that break clock encoding.
    #[error("invalid replica id {id:?}: {reason}")]
    InvalidReplicaId {
        /// The rejected identifier.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A vector clock string could not be parsed.
    #[error("invalid vector clock {input:?}")]
    InvalidVectorClock {
        /// The rejected input.
        input: String,
    },

    /// A file version was added to a history it does not belong to, or out of order.
    #[error("invalid file version for history {history}: {msg}")]
    InvalidFileVersion {
        /// Target history id.
        history: String,
        /// What was wrong.
        msg: String,
    },

    /// A database version does not advance its author's own clock coordinate.
    #[error("database version {replica}/{sequence} does not advance past {previous}")]
    ClockRegression {
        /// Authoring replica.
        replica: String,
        /// Sequence carried by the version.
        sequence: u64,
        /// Highest sequence already applied for that replica.
        previous: u64,
    },

    /// A file history cannot be merged; that history is left untouched.
    #[error("unreconcilable history {history}: {reason}")]
    UnreconcilableHistory {
        /// History id.
        history: String,
        /// What made it unreconcilable.
        reason: String,
    },

    /// Reassembled content does not match the stored file digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Target path.
        path: String,
        /// Digest recorded in the file version.
        expected: String,
        /// Digest of the reassembled bytes.
        actual: String,
    },

    /// No manifest or container is known for the requested content.
    #[error("missing content: {msg}")]
    MissingContent {
        /// What could not be found.
        msg: String,
    },

    /// The local entry an action expects changed after planning.
    #[error("stale action for {path}: {msg}")]
    StaleAction {
        /// Affected path.
        path: String,
        /// What changed.
        msg: String,
    },

    /// A remote file name or document is malformed.
    #[error("malformed remote object: {msg}")]
    MalformedRemote {
        /// Error message describing the issue.
        msg: String,
    },

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Chunking, packing or container read failure.
    #[error("reduce error: {0}")]
    Reduce(#[from] ReduceError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
