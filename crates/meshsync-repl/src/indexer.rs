//! Turns the local tree into the next local database version.
//!
//! The scan is compared with the visible tree (paths resolved the way a merge resolves
//! them). Content not yet known to the database runs through the deduper; its events
//! become content manifests and container records.

use crate::database::Database;
use crate::error::ReplResult;
use crate::local_tree::{is_safe_path, LocalEntry, LocalTree};
use crate::model::{
    DatabaseVersion, FileContent, FileHistoryId, FileStatus, FileType, FileVersion, MultiChunkRecord,
};
use meshsync_reduce::{
    ChunkDigest, ContainerStore, DedupEvent, DedupListener, DedupSummary, Deduper, SealedMultiChunk,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Collects deduper events into manifests and sealed containers.
#[derive(Debug, Default)]
pub struct IndexListener {
    current: Vec<ChunkDigest>,
    /// Completed files, by the path handed to the deduper.
    pub contents: HashMap<PathBuf, FileContent>,
    /// Containers sealed during the run.
    pub sealed: Vec<SealedMultiChunk>,
    /// Final run totals.
    pub summary: Option<DedupSummary>,
}

impl DedupListener for IndexListener {
    fn on_event(&mut self, event: DedupEvent) {
        match event {
            DedupEvent::FileStarted { .. } => self.current.clear(),
            DedupEvent::ChunkObserved { digest, .. } => self.current.push(digest),
            DedupEvent::FileEnded {
                path,
                size,
                file_digest,
            } => {
                let content = FileContent {
                    checksum: file_digest,
                    size,
                    chunks: std::mem::take(&mut self.current),
                };
                self.contents.insert(path, content);
            }
            DedupEvent::MultiChunkClosed(sealed) => self.sealed.push(sealed),
            DedupEvent::MultiChunkDiscarded { id } => {
                warn!(container = %id, "container discarded during indexing");
            }
            DedupEvent::RunFinished(summary) => self.summary = Some(summary),
            _ => {}
        }
    }
}

/// Result of one indexing pass.
#[derive(Debug, Default)]
pub struct IndexOutcome {
    /// The new local version, if anything changed.
    pub version: Option<DatabaseVersion>,
    /// Containers written to the store, to be uploaded before the version.
    pub sealed: Vec<SealedMultiChunk>,
    /// Paths left for a later pass (transaction limit hit, or changed while reading).
    pub deferred: Vec<String>,
}

/// Builds local database versions from scans.
pub struct Indexer<'a> {
    root: &'a Path,
    state_dir: &'a str,
    db: &'a Database,
    deduper: &'a Deduper,
}

enum Pending {
    New(String, LocalEntry),
    Changed(FileVersion, LocalEntry),
}

impl Pending {
    fn path(&self) -> &str {
        match self {
            Pending::New(path, _) => path,
            Pending::Changed(head, _) => &head.path,
        }
    }

    fn entry(&self) -> &LocalEntry {
        match self {
            Pending::New(_, entry) | Pending::Changed(_, entry) => entry,
        }
    }
}

impl<'a> Indexer<'a> {
    /// Indexer over `root`, whose top-level `state_dir` is never indexed.
    pub fn new(root: &'a Path, state_dir: &'a str, db: &'a Database, deduper: &'a Deduper) -> Self {
        Self {
            root,
            state_dir,
            db,
            deduper,
        }
    }

    /// Diff `disk` against the visible tree `tree` and build the next version.
    ///
    /// New containers are written to `store`; the database is not modified.
    #[instrument(skip_all, fields(root = %self.root.display(), entries = disk.len()))]
    pub fn index<S: ContainerStore>(
        &self,
        tree: &BTreeMap<FileHistoryId, FileVersion>,
        disk: &LocalTree,
        store: &mut S,
        timestamp_ms: u64,
    ) -> ReplResult<IndexOutcome> {
        let by_path: HashMap<&str, &FileVersion> =
            tree.values().map(|v| (v.path.as_str(), v)).collect();

        let mut versions: Vec<FileVersion> = Vec::new();
        let mut pending: Vec<Pending> = Vec::new();
        let mut untracked: Vec<(&str, &LocalEntry)> = Vec::new();
        let mut present: BTreeSet<FileHistoryId> = BTreeSet::new();

        for (path, entry) in disk.iter() {
            if !is_safe_path(path, self.state_dir) {
                warn!(%path, "skipping entry with unsupported name");
                continue;
            }
            let Some(head) = by_path.get(path.as_str()).copied() else {
                untracked.push((path.as_str(), entry));
                continue;
            };
            if head.file_type != entry.file_type {
                untracked.push((path.as_str(), entry));
                continue;
            }
            present.insert(head.history);

            if !entry.matches(head) {
                if head.file_type == FileType::File {
                    pending.push(Pending::Changed(head.clone(), entry.clone()));
                } else {
                    versions.push(changed(head, entry));
                }
            } else if !entry.attributes_match(head) {
                versions.push(head.successor(FileStatus::Changed, |v| v.permissions = entry.permissions));
            } else if self.recorded_path(head) != Some(head.path.as_str()) {
                debug!(path = %head.path, "recording resolved path");
                versions.push(head.successor(FileStatus::Renamed, |_| {}));
            }
        }

        // vanished heads are rename candidates, in path order
        let mut vanished: Vec<&FileVersion> = tree.values().filter(|v| !present.contains(&v.history)).collect();
        vanished.sort_by(|a, b| a.path.cmp(&b.path));
        let mut renamed: BTreeSet<FileHistoryId> = BTreeSet::new();

        for (path, entry) in untracked {
            let source = (entry.file_type != FileType::Folder)
                .then(|| {
                    vanished
                        .iter()
                        .find(|v| !renamed.contains(&v.history) && entry.matches(v))
                        .copied()
                })
                .flatten();
            match source {
                Some(head) => {
                    renamed.insert(head.history);
                    versions.push(head.successor(FileStatus::Renamed, |v| {
                        v.path = path.to_string();
                        v.permissions = entry.permissions;
                    }));
                }
                None if entry.file_type == FileType::File => {
                    pending.push(Pending::New(path.to_string(), entry.clone()));
                }
                None => versions.push(new_version(path, entry)),
            }
        }

        for head in vanished.into_iter().filter(|v| !renamed.contains(&v.history)) {
            versions.push(head.successor(FileStatus::Deleted, |_| {}));
        }

        let mut outcome = IndexOutcome::default();
        let mut contents: Vec<FileContent> = Vec::new();
        let listener = self.deduplicate(&pending, store)?;

        let produced: HashMap<ChunkDigest, &FileContent> =
            listener.contents.values().map(|c| (c.checksum, c)).collect();
        for item in pending {
            let path = item.path().to_string();
            if let Some(checksum) = item.entry().checksum {
                if self.db.content(&checksum).is_none() {
                    match produced.get(&checksum) {
                        Some(content) => {
                            if !contents.iter().any(|c| c.checksum == checksum) {
                                contents.push((*content).clone());
                            }
                        }
                        None => {
                            if listener.contents.contains_key(&self.root.join(&path)) {
                                warn!(%path, "file changed while indexing, deferring");
                            }
                            outcome.deferred.push(path);
                            continue;
                        }
                    }
                }
            }
            versions.push(match &item {
                Pending::New(path, entry) => new_version(path, entry),
                Pending::Changed(head, entry) => changed(head, entry),
            });
        }

        versions.sort_by(|a, b| a.path.cmp(&b.path).then(a.history.cmp(&b.history)));
        let mut builder = DatabaseVersion::builder(self.db.next_header(timestamp_ms));
        for sealed in &listener.sealed {
            builder = builder.multichunk(MultiChunkRecord {
                id: sealed.id,
                chunks: sealed.chunks.clone(),
            });
        }
        for content in contents {
            builder = builder.file_content(content);
        }
        for version in versions {
            builder = builder.file_version(version);
        }

        outcome.sealed = listener.sealed;
        if !builder.is_empty() {
            let version = builder.build();
            info!(
                version = %version.id(),
                files = version.file_versions().len(),
                contents = version.file_contents().len(),
                containers = version.multichunks().len(),
                deferred = outcome.deferred.len(),
                "indexed local changes"
            );
            outcome.version = Some(version);
        } else {
            debug!(deferred = outcome.deferred.len(), "no local changes");
        }
        Ok(outcome)
    }

    /// Run the deduper over pending files whose content the database lacks.
    fn deduplicate<S: ContainerStore>(&self, pending: &[Pending], store: &mut S) -> ReplResult<IndexListener> {
        let mut seen: BTreeSet<ChunkDigest> = BTreeSet::new();
        let paths: Vec<PathBuf> = pending
            .iter()
            .filter(|p| match p.entry().checksum {
                Some(c) => self.db.content(&c).is_none() && seen.insert(c),
                None => true,
            })
            .map(|p| self.root.join(p.path()))
            .collect();

        let mut listener = IndexListener::default();
        if paths.is_empty() {
            return Ok(listener);
        }
        self.deduper
            .deduplicate_files(&paths, self.db.chunk_index(), store, &mut listener)?;
        Ok(listener)
    }

    fn recorded_path(&self, version: &FileVersion) -> Option<&str> {
        self.db.head(&version.history).map(|(v, _)| v.path.as_str())
    }
}

fn new_version(path: &str, entry: &LocalEntry) -> FileVersion {
    FileVersion {
        history: FileHistoryId::random(),
        version: 1,
        path: path.to_string(),
        file_type: entry.file_type,
        status: FileStatus::New,
        size: entry.size,
        checksum: entry.checksum,
        link_target: entry.link_target.clone(),
        permissions: entry.permissions,
    }
}

fn changed(head: &FileVersion, entry: &LocalEntry) -> FileVersion {
    head.successor(FileStatus::Changed, |v| {
        v.size = entry.size;
        v.checksum = entry.checksum;
        v.link_target = entry.link_target.clone();
        v.permissions = entry.permissions;
    })
}
