//! Dedup oracle and an in-memory chunk index with container locations and refcounts

use crate::digest::ChunkDigest;
use crate::multichunk::{MultiChunkId, SealedMultiChunk};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Answers whether a chunk is already stored durably
pub trait ChunkIndex {
    /// True if a sealed container already holds `digest`
    fn is_known_chunk(&self, digest: &ChunkDigest) -> bool;
}

impl ChunkIndex for HashSet<ChunkDigest> {
    fn is_known_chunk(&self, digest: &ChunkDigest) -> bool {
        self.contains(digest)
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    container: MultiChunkId,
    refcount: u64,
}

/// Chunk digest → container map with reference counts.
///
/// Chunks enter only through [`MemoryChunkIndex::record_sealed`], so the index never
/// claims a chunk whose container was not sealed.
#[derive(Debug, Default, Clone)]
pub struct MemoryChunkIndex {
    entries: HashMap<ChunkDigest, IndexEntry>,
}

impl MemoryChunkIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every member of a sealed container. Already known chunks keep their
    /// first location.
    pub fn record_sealed(&mut self, sealed: &SealedMultiChunk) {
        for entry in &sealed.chunks {
            self.entries.entry(entry.digest).or_insert(IndexEntry {
                container: sealed.id,
                refcount: 0,
            });
        }
        debug!(container = %sealed.id, chunks = sealed.chunks.len(), "indexed sealed multichunk");
    }

    /// Register a chunk location learned from metadata (e.g. a remote database version)
    pub fn insert_location(&mut self, digest: ChunkDigest, container: MultiChunkId) {
        self.entries.entry(digest).or_insert(IndexEntry {
            container,
            refcount: 0,
        });
    }

    /// Container holding `digest`
    pub fn locate(&self, digest: &ChunkDigest) -> Option<MultiChunkId> {
        self.entries.get(digest).map(|e| e.container)
    }

    /// Increment the refcount of a known chunk; false if unknown
    pub fn add_reference(&mut self, digest: &ChunkDigest) -> bool {
        match self.entries.get_mut(digest) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Current reference count (0 if not present)
    pub fn refcount(&self, digest: &ChunkDigest) -> u64 {
        self.entries.get(digest).map(|e| e.refcount).unwrap_or(0)
    }

    /// Number of unique chunks tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChunkIndex for MemoryChunkIndex {
    fn is_known_chunk(&self, digest: &ChunkDigest) -> bool {
        self.entries.contains_key(digest)
    }
}
