//! Metadata entities: file histories, file versions and database versions.

use crate::error::{ReplError, ReplResult};
use crate::vector_clock::{ReplicaId, VectorClock};
use meshsync_reduce::{ChunkDigest, MultiChunkEntry, MultiChunkId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of one logical file across renames and content changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHistoryId(pub Uuid);

impl FileHistoryId {
    /// Fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FileHistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of file system entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Folder,
    /// Symbolic link.
    Symlink,
}

/// What a version did to its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// First version of the history.
    New,
    /// Content or attributes changed.
    Changed,
    /// Path changed.
    Renamed,
    /// Tombstone.
    Deleted,
}

/// One mutation of a file history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Owning history.
    pub history: FileHistoryId,
    /// Strictly increasing within the history, starting at 1.
    pub version: u64,
    /// Path relative to the sync root, `/`-separated.
    pub path: String,
    /// Entry kind.
    pub file_type: FileType,
    /// What this version did.
    pub status: FileStatus,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Whole-file digest; set for files only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChunkDigest>,
    /// Target of a symlink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// POSIX permission bits, where the platform has them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl FileVersion {
    /// True for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }

    /// True if both describe the same content (type, digest, link target), ignoring
    /// path, status and attributes.
    pub fn same_content(&self, other: &FileVersion) -> bool {
        self.file_type == other.file_type
            && self.checksum == other.checksum
            && self.link_target == other.link_target
    }

    /// Next version of this history with the given changes applied by `f`.
    pub fn successor(&self, status: FileStatus, f: impl FnOnce(&mut FileVersion)) -> FileVersion {
        let mut next = self.clone();
        next.version += 1;
        next.status = status;
        f(&mut next);
        next
    }
}

/// Ordered sequence of versions of one logical file; the last version is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    id: FileHistoryId,
    versions: Vec<FileVersion>,
}

impl FileHistory {
    /// Empty history.
    pub fn new(id: FileHistoryId) -> Self {
        Self {
            id,
            versions: Vec::new(),
        }
    }

    /// History id.
    pub fn id(&self) -> FileHistoryId {
        self.id
    }

    /// Append a version. Rejected if it belongs to another history or does not
    /// increase the version number.
    pub fn add_version(&mut self, version: FileVersion) -> ReplResult<()> {
        if version.history != self.id {
            return Err(ReplError::InvalidFileVersion {
                history: self.id.to_string(),
                msg: format!("version belongs to history {}", version.history),
            });
        }
        if let Some(last) = self.versions.last() {
            if version.version <= last.version {
                return Err(ReplError::InvalidFileVersion {
                    history: self.id.to_string(),
                    msg: format!(
                        "version {} does not follow version {}",
                        version.version, last.version
                    ),
                });
            }
        }
        self.versions.push(version);
        Ok(())
    }

    /// Current state.
    pub fn last_version(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> &[FileVersion] {
        &self.versions
    }

    /// Drop every version above `version`.
    pub(crate) fn retain_through(&mut self, version: u64) {
        self.versions.retain(|v| v.version <= version);
    }
}

/// Identity of a database version: authoring replica and its own clock coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseVersionId {
    /// Authoring replica.
    pub replica: ReplicaId,
    /// Author's local sequence number.
    pub sequence: u64,
}

impl fmt::Display for DatabaseVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.replica, self.sequence)
    }
}

/// Header of a database version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersionHeader {
    /// Authoring replica.
    pub replica: ReplicaId,
    /// Causal stamp; the author's own coordinate is the version's sequence.
    pub vector_clock: VectorClock,
    /// Wall-clock authoring time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl DatabaseVersionHeader {
    /// Sequence number: the author's own clock coordinate.
    pub fn sequence(&self) -> u64 {
        self.vector_clock.get_clock(&self.replica)
    }

    /// Identity of the version.
    pub fn id(&self) -> DatabaseVersionId {
        DatabaseVersionId {
            replica: self.replica.clone(),
            sequence: self.sequence(),
        }
    }
}

/// Chunks packed into one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkRecord {
    /// Container id.
    pub id: MultiChunkId,
    /// Member chunks.
    pub chunks: Vec<MultiChunkEntry>,
}

/// Ordered chunk list that reassembles one file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// Whole-file digest.
    pub checksum: ChunkDigest,
    /// Total size.
    pub size: u64,
    /// Chunk digests in file order.
    pub chunks: Vec<ChunkDigest>,
}

/// One append-only unit of change history. Built once, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseVersion {
    header: DatabaseVersionHeader,
    multichunks: Vec<MultiChunkRecord>,
    file_contents: Vec<FileContent>,
    file_versions: Vec<FileVersion>,
}

impl DatabaseVersion {
    /// Start building a version.
    pub fn builder(header: DatabaseVersionHeader) -> DatabaseVersionBuilder {
        DatabaseVersionBuilder {
            version: DatabaseVersion {
                header,
                multichunks: Vec::new(),
                file_contents: Vec::new(),
                file_versions: Vec::new(),
            },
        }
    }

    /// Header.
    pub fn header(&self) -> &DatabaseVersionHeader {
        &self.header
    }

    /// Identity.
    pub fn id(&self) -> DatabaseVersionId {
        self.header.id()
    }

    /// Containers introduced by this version.
    pub fn multichunks(&self) -> &[MultiChunkRecord] {
        &self.multichunks
    }

    /// File content manifests introduced by this version.
    pub fn file_contents(&self) -> &[FileContent] {
        &self.file_contents
    }

    /// File versions introduced by this version.
    pub fn file_versions(&self) -> &[FileVersion] {
        &self.file_versions
    }

    pub(crate) fn from_parts(
        header: DatabaseVersionHeader,
        multichunks: Vec<MultiChunkRecord>,
        file_contents: Vec<FileContent>,
        file_versions: Vec<FileVersion>,
    ) -> Self {
        Self {
            header,
            multichunks,
            file_contents,
            file_versions,
        }
    }
}

/// Accumulates records for a new [`DatabaseVersion`].
#[derive(Debug)]
pub struct DatabaseVersionBuilder {
    version: DatabaseVersion,
}

impl DatabaseVersionBuilder {
    /// Add a container record.
    pub fn multichunk(mut self, record: MultiChunkRecord) -> Self {
        self.version.multichunks.push(record);
        self
    }

    /// Add a content manifest.
    pub fn file_content(mut self, content: FileContent) -> Self {
        self.version.file_contents.push(content);
        self
    }

    /// Add a file version.
    pub fn file_version(mut self, version: FileVersion) -> Self {
        self.version.file_versions.push(version);
        self
    }

    /// True if no file version was added.
    pub fn is_empty(&self) -> bool {
        self.version.file_versions.is_empty()
    }

    /// Freeze the version.
    pub fn build(self) -> DatabaseVersion {
        self.version
    }
}
