#![warn(missing_docs)]

//! meshsync replication subsystem: vector clocks, database version reconciliation, file system action planning
//!
//! Up:   Local tree → Indexer (Deduper) → Containers + DatabaseVersion → Remote
//! Down: Remote → DatabaseVersions → Reconciler → Target tree → Action plan → Executor → Local tree

pub mod actions;
pub mod config;
pub mod conflict;
pub mod database;
pub mod document;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod local_tree;
pub mod model;
pub mod reconciler;
pub mod sync;
pub mod transfer;
pub mod vector_clock;

pub use actions::{ActionKind, FileSystemAction, FileSystemActionReconciler};
pub use config::SyncConfig;
pub use conflict::{
    conflict_copy_path, ConflictKind, ConflictPolicyKind, ConflictRecord, EarliestTimestamp, ReplicaPriority,
    TieBreakPolicy,
};
pub use database::Database;
pub use error::{ReplError, ReplResult};
pub use executor::{ActionExecutor, ActionOutcome, ActionResult};
pub use indexer::{IndexOutcome, Indexer};
pub use local_tree::{LocalEntry, LocalTree};
pub use model::{
    DatabaseVersion, DatabaseVersionHeader, DatabaseVersionId, FileContent, FileHistory, FileHistoryId,
    FileStatus, FileType, FileVersion, MultiChunkRecord,
};
pub use reconciler::{AbortedHistory, DatabaseReconciler, MergeResult, MergedHead};
pub use sync::{DownReport, SyncContext, UpReport};
pub use transfer::{ContentFetcher, LocalDirectoryRemote, MetadataExchange, RemoteUpload};
pub use vector_clock::{ClockOrdering, ReplicaId, VectorClock};
