//! In-memory local metadata store.
//!
//! Holds everything a replica has applied: version headers, the applied vector clock,
//! file histories with the header that introduced each version, container records,
//! the chunk → container index and file content manifests.

use crate::error::{ReplError, ReplResult};
use crate::model::{
    DatabaseVersion, DatabaseVersionHeader, DatabaseVersionId, FileContent, FileHistory,
    FileHistoryId, FileVersion, MultiChunkRecord,
};
use crate::reconciler::MergeResult;
use crate::vector_clock::{ReplicaId, VectorClock};
use meshsync_reduce::{ChunkDigest, MemoryChunkIndex, MultiChunkId};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct HistoryRecord {
    history: FileHistory,
    origins: BTreeMap<u64, DatabaseVersionHeader>,
}

impl HistoryRecord {
    fn new(id: FileHistoryId) -> Self {
        Self {
            history: FileHistory::new(id),
            origins: BTreeMap::new(),
        }
    }

    fn push(&mut self, version: FileVersion, origin: &DatabaseVersionHeader) -> ReplResult<()> {
        let number = version.version;
        self.history.add_version(version)?;
        self.origins.insert(number, origin.clone());
        Ok(())
    }
}

/// Local metadata database of one replica.
#[derive(Debug, Clone)]
pub struct Database {
    replica: ReplicaId,
    clock: VectorClock,
    applied: BTreeMap<DatabaseVersionId, DatabaseVersionHeader>,
    last_sequence: BTreeMap<ReplicaId, u64>,
    histories: BTreeMap<FileHistoryId, HistoryRecord>,
    multichunks: BTreeMap<MultiChunkId, MultiChunkRecord>,
    chunks: MemoryChunkIndex,
    contents: HashMap<ChunkDigest, FileContent>,
}

impl Database {
    /// Empty database for `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: VectorClock::new(),
            applied: BTreeMap::new(),
            last_sequence: BTreeMap::new(),
            histories: BTreeMap::new(),
            multichunks: BTreeMap::new(),
            chunks: MemoryChunkIndex::new(),
            contents: HashMap::new(),
        }
    }

    /// Owning replica.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Pointwise maximum of every applied version's clock.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// True if the version was applied.
    pub fn is_applied(&self, id: &DatabaseVersionId) -> bool {
        self.applied.contains_key(id)
    }

    /// Applied version headers, by id.
    pub fn applied(&self) -> impl Iterator<Item = &DatabaseVersionHeader> {
        self.applied.values()
    }

    /// Highest applied sequence per replica.
    pub fn last_sequences(&self) -> &BTreeMap<ReplicaId, u64> {
        &self.last_sequence
    }

    /// Highest applied sequence of `replica`, 0 if none.
    pub fn last_sequence(&self, replica: &ReplicaId) -> u64 {
        self.last_sequence.get(replica).copied().unwrap_or(0)
    }

    /// One history.
    pub fn history(&self, id: &FileHistoryId) -> Option<&FileHistory> {
        self.histories.get(id).map(|r| &r.history)
    }

    /// Header of the database version that introduced `version` of history `id`.
    pub fn origin(&self, id: &FileHistoryId, version: u64) -> Option<&DatabaseVersionHeader> {
        self.histories.get(id)?.origins.get(&version)
    }

    /// Current version of a history and the header that introduced it.
    pub fn head(&self, id: &FileHistoryId) -> Option<(&FileVersion, &DatabaseVersionHeader)> {
        let record = self.histories.get(id)?;
        let head = record.history.last_version()?;
        Some((head, record.origins.get(&head.version)?))
    }

    /// Every history's current version, tombstones included.
    pub fn heads(&self) -> impl Iterator<Item = (&FileVersion, &DatabaseVersionHeader)> {
        self.histories.keys().filter_map(|id| self.head(id))
    }

    /// Visible tree: the non-deleted heads, by history.
    pub fn tree(&self) -> BTreeMap<FileHistoryId, FileVersion> {
        self.heads()
            .filter(|(v, _)| !v.is_deleted())
            .map(|(v, _)| (v.history, v.clone()))
            .collect()
    }

    /// Non-deleted head recorded at `path`.
    pub fn find_by_path(&self, path: &str) -> Option<&FileVersion> {
        self.heads()
            .map(|(v, _)| v)
            .find(|v| !v.is_deleted() && v.path == path)
    }

    /// Content manifest for a whole-file digest.
    pub fn content(&self, checksum: &ChunkDigest) -> Option<&FileContent> {
        self.contents.get(checksum)
    }

    /// Container record.
    pub fn multichunk(&self, id: &MultiChunkId) -> Option<&MultiChunkRecord> {
        self.multichunks.get(id)
    }

    /// Container holding a chunk.
    pub fn locate_chunk(&self, digest: &ChunkDigest) -> Option<MultiChunkId> {
        self.chunks.locate(digest)
    }

    /// Chunk index, usable as the dedup oracle.
    pub fn chunk_index(&self) -> &MemoryChunkIndex {
        &self.chunks
    }

    /// Header for the next local version: applied clock with the own coordinate bumped.
    pub fn next_header(&self, timestamp_ms: u64) -> DatabaseVersionHeader {
        let mut vector_clock = self.clock.clone();
        vector_clock.increment_clock(&self.replica);
        DatabaseVersionHeader {
            replica: self.replica.clone(),
            vector_clock,
            timestamp_ms,
        }
    }

    /// Append a version authored by this replica.
    ///
    /// Nothing changes if the version fails validation.
    pub fn apply_local(&mut self, version: &DatabaseVersion) -> ReplResult<()> {
        let header = version.header();
        self.check_sequence(header, self.last_sequence(&header.replica))?;

        let mut touched: BTreeMap<FileHistoryId, HistoryRecord> = BTreeMap::new();
        for fv in version.file_versions() {
            let record = touched.entry(fv.history).or_insert_with(|| {
                self.histories
                    .get(&fv.history)
                    .cloned()
                    .unwrap_or_else(|| HistoryRecord::new(fv.history))
            });
            record.push(fv.clone(), header)?;
        }

        self.record_content(version);
        self.histories.extend(touched);
        self.mark_applied(header);
        self.clock = self.clock.merge(&header.vector_clock);
        info!(
            version = %version.id(),
            clock = %self.clock,
            files = version.file_versions().len(),
            "applied local database version"
        );
        Ok(())
    }

    /// Apply a reconciliation result: every applied version's content records, the
    /// merged history heads and the merged clock.
    ///
    /// Every sequence is checked before anything changes.
    pub fn apply_merge(&mut self, merge: &MergeResult) -> ReplResult<()> {
        let mut sequences = self.last_sequence.clone();
        for version in &merge.applied {
            let header = version.header();
            let previous = sequences.get(&header.replica).copied().unwrap_or(0);
            self.check_sequence(header, previous)?;
            sequences.insert(header.replica.clone(), header.sequence());
        }

        for version in &merge.applied {
            self.record_content(version);
            self.mark_applied(version.header());
        }

        for (id, merged) in &merge.heads {
            let record = self
                .histories
                .entry(*id)
                .or_insert_with(|| HistoryRecord::new(*id));
            record.history.retain_through(merged.base);
            record.origins.retain(|v, _| *v <= merged.base);
            for (fv, origin) in &merged.updates {
                record.push(fv.clone(), origin)?;
            }
        }

        self.clock = self.clock.merge(&merge.clock);
        info!(
            versions = merge.applied.len(),
            histories = merge.heads.len(),
            clock = %self.clock,
            "applied merge"
        );
        Ok(())
    }

    fn check_sequence(&self, header: &DatabaseVersionHeader, previous: u64) -> ReplResult<()> {
        let sequence = header.sequence();
        if sequence <= previous {
            return Err(ReplError::ClockRegression {
                replica: header.replica.to_string(),
                sequence,
                previous,
            });
        }
        Ok(())
    }

    fn mark_applied(&mut self, header: &DatabaseVersionHeader) {
        self.applied.insert(header.id(), header.clone());
        let last = self.last_sequence.entry(header.replica.clone()).or_insert(0);
        *last = (*last).max(header.sequence());
    }

    fn record_content(&mut self, version: &DatabaseVersion) {
        for record in version.multichunks() {
            for entry in &record.chunks {
                self.chunks.insert_location(entry.digest, record.id);
            }
            self.multichunks.insert(record.id, record.clone());
        }
        for content in version.file_contents() {
            if self.contents.contains_key(&content.checksum) {
                continue;
            }
            for digest in &content.chunks {
                self.chunks.add_reference(digest);
            }
            debug!(checksum = %content.checksum.short(), chunks = content.chunks.len(), "recorded file content");
            self.contents.insert(content.checksum, content.clone());
        }
    }
}
