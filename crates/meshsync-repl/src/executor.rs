//! Applies planned file system actions.
//!
//! Actions run one by one and independently: a failure is recorded in that action's
//! outcome and execution continues. File content is reassembled from containers into a
//! scratch file under the state directory, verified against the whole-file digest and only
//! then renamed into place.

use crate::actions::{ActionKind, FileSystemAction, STAGING_DIR};
use crate::database::Database;
use crate::error::{ReplError, ReplResult};
use crate::local_tree::LocalEntry;
use crate::model::{FileType, FileVersion};
use crate::transfer::ContentFetcher;
use bytes::Bytes;
use meshsync_reduce::{ChunkDigest, DigestAlgorithm, MultiChunkId, MultiChunker};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

/// Scratch directory under the state directory for content being assembled.
pub const TMP_DIR: &str = "tmp";

/// How one action ended.
#[derive(Debug)]
pub enum ActionResult {
    /// The file system was changed.
    Applied,
    /// Nothing to do, with the reason.
    Skipped(String),
    /// The action failed; the entry is left in its prior state.
    Failed(ReplError),
}

/// An action and how it ended.
#[derive(Debug)]
pub struct ActionOutcome {
    /// The action.
    pub action: FileSystemAction,
    /// Its result.
    pub result: ActionResult,
}

impl ActionOutcome {
    /// True if the action failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.result, ActionResult::Failed(_))
    }
}

/// Executes actions against a sync root.
pub struct ActionExecutor<'a> {
    root: &'a Path,
    state_dir: &'a str,
    db: &'a Database,
    multichunker: &'a MultiChunker,
    fetcher: &'a dyn ContentFetcher,
    digest: DigestAlgorithm,
    containers: HashMap<MultiChunkId, BTreeMap<ChunkDigest, Bytes>>,
}

impl<'a> ActionExecutor<'a> {
    /// `db` must already contain the content records of every target version.
    pub fn new(
        root: &'a Path,
        state_dir: &'a str,
        db: &'a Database,
        multichunker: &'a MultiChunker,
        fetcher: &'a dyn ContentFetcher,
        digest: DigestAlgorithm,
    ) -> Self {
        Self {
            root,
            state_dir,
            db,
            multichunker,
            fetcher,
            digest,
            containers: HashMap::new(),
        }
    }

    /// Run `actions` in order, one outcome per action. Only failing to prepare the
    /// scratch directory aborts the run.
    #[instrument(skip_all, fields(root = %self.root.display(), actions = actions.len()))]
    pub async fn execute(&mut self, actions: Vec<FileSystemAction>) -> ReplResult<Vec<ActionOutcome>> {
        self.clean_scratch().await?;

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let result = match self.apply(&action).await {
                Ok(None) => {
                    debug!(%action, "applied");
                    ActionResult::Applied
                }
                Ok(Some(reason)) => {
                    debug!(%action, %reason, "skipped");
                    ActionResult::Skipped(reason)
                }
                Err(e) => {
                    error!(%action, error = %e, "action failed");
                    ActionResult::Failed(e)
                }
            };
            outcomes.push(ActionOutcome { action, result });
        }

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o.result, ActionResult::Skipped(_)))
            .count();
        info!(
            applied = outcomes.len() - failed - skipped,
            skipped,
            failed,
            containers = self.containers.len(),
            "executed file system actions"
        );
        Ok(outcomes)
    }

    fn scratch_dir(&self) -> PathBuf {
        self.root.join(self.state_dir).join(TMP_DIR)
    }

    /// Remove leftovers of an interrupted run.
    async fn clean_scratch(&self) -> ReplResult<()> {
        for dir in [self.scratch_dir(), self.root.join(self.state_dir).join(STAGING_DIR)] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(dir = %dir.display(), "removed leftover scratch data"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        fs::create_dir_all(self.scratch_dir()).await?;
        Ok(())
    }

    async fn apply(&mut self, action: &FileSystemAction) -> ReplResult<Option<String>> {
        let path = self.root.join(&action.path);
        match action.kind {
            ActionKind::Renamed => self.rename(action, &path).await,
            ActionKind::Deleted => self.delete(action, &path).await,
            ActionKind::SetAttributes => {
                set_permissions(&path, target_of(action)?).await?;
                Ok(None)
            }
            ActionKind::New | ActionKind::Changed => match action.file_type {
                FileType::Folder => create_folder(&path, target_of(action)?).await,
                FileType::File => self.write_file(action, &path).await,
                FileType::Symlink => write_symlink(action, &path, self.digest).await,
            },
        }
    }

    async fn rename(&self, action: &FileSystemAction, dst: &Path) -> ReplResult<Option<String>> {
        let from = action.from.as_deref().ok_or_else(|| ReplError::StaleAction {
            path: action.path.clone(),
            msg: "rename without source".into(),
        })?;
        let src = self.root.join(from);
        let src_entry = LocalEntry::load(&src, self.digest)?;
        let dst_entry = LocalEntry::load(dst, self.digest)?;

        let Some(src_entry) = src_entry else {
            if let (Some(target), Some(existing)) = (&action.target, &dst_entry) {
                if existing.matches(target) {
                    return Ok(Some("already renamed".into()));
                }
            }
            return Err(ReplError::StaleAction {
                path: from.to_string(),
                msg: "rename source is gone".into(),
            });
        };
        if let Some(target) = &action.target {
            if !src_entry.matches(target) {
                return Err(ReplError::StaleAction {
                    path: from.to_string(),
                    msg: "rename source changed".into(),
                });
            }
        }
        if action.is_relocation() && dst_entry.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("conflict copy {} already exists", action.path),
            )
            .into());
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&src, dst).await?;
        if let Some(target) = &action.target {
            set_permissions(dst, target).await?;
        }
        Ok(None)
    }

    async fn delete(&self, action: &FileSystemAction, path: &Path) -> ReplResult<Option<String>> {
        let expected = target_of(action)?;
        let Some(entry) = LocalEntry::load(path, self.digest)? else {
            return Ok(Some("already gone".into()));
        };
        if !entry.matches(expected) {
            warn!(path = %action.path, "entry changed since planning, keeping it");
            return Ok(Some("changed since planning".into()));
        }
        if entry.file_type == FileType::Folder {
            let mut children = fs::read_dir(path).await?;
            if children.next_entry().await?.is_some() {
                return Ok(Some("folder not empty".into()));
            }
            fs::remove_dir(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(None)
    }

    async fn write_file(&mut self, action: &FileSystemAction, path: &Path) -> ReplResult<Option<String>> {
        let target = target_of(action)?;
        let expected = target.checksum.ok_or_else(|| ReplError::InvalidFileVersion {
            history: target.history.to_string(),
            msg: "file version without checksum".into(),
        })?;
        if let Some(existing) = LocalEntry::load(path, self.digest)? {
            if existing.matches(target) {
                set_permissions(path, target).await?;
                return Ok(Some("already up to date".into()));
            }
        }

        let chunks = match self.db.content(&expected) {
            Some(content) => content.chunks.clone(),
            None if target.size == 0 => Vec::new(),
            None => {
                return Err(ReplError::MissingContent {
                    msg: format!("no content manifest for {}", expected.short()),
                })
            }
        };

        let tmp = self
            .scratch_dir()
            .join(format!("{}-{}.part", target.history, target.version));
        let actual = match self.assemble(&tmp, &chunks).await {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if actual != expected {
            let _ = fs::remove_file(&tmp).await;
            return Err(ReplError::ChecksumMismatch {
                path: action.path.clone(),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        set_permissions(&tmp, target).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&tmp, path).await?;
        Ok(None)
    }

    async fn assemble(&mut self, tmp: &Path, chunks: &[ChunkDigest]) -> ReplResult<ChunkDigest> {
        let mut file = fs::File::create(tmp).await?;
        let mut hasher = self.digest.hasher();
        for digest in chunks {
            let data = self.chunk(digest).await?;
            hasher.update(&data);
            file.write_all(&data).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(hasher.finalize())
    }

    /// Chunk bytes, fetching each container at most once per executor.
    async fn chunk(&mut self, digest: &ChunkDigest) -> ReplResult<Bytes> {
        let container = self
            .db
            .locate_chunk(digest)
            .ok_or_else(|| ReplError::MissingContent {
                msg: format!("chunk {} is in no known container", digest.short()),
            })?;
        if !self.containers.contains_key(&container) {
            let stored = self.fetcher.fetch(&container).await?;
            let chunks = self.multichunker.read_container(&container, &stored)?;
            debug!(%container, chunks = chunks.len(), "fetched multichunk");
            self.containers.insert(container, chunks);
        }
        self.containers
            .get(&container)
            .and_then(|chunks| chunks.get(digest))
            .cloned()
            .ok_or_else(|| ReplError::MissingContent {
                msg: format!("container {} lacks chunk {}", container, digest.short()),
            })
    }
}

fn target_of(action: &FileSystemAction) -> ReplResult<&FileVersion> {
    action.target.as_ref().ok_or_else(|| ReplError::StaleAction {
        path: action.path.clone(),
        msg: "action carries no version".into(),
    })
}

async fn create_folder(path: &Path, target: &FileVersion) -> ReplResult<Option<String>> {
    if fs::symlink_metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return Ok(Some("already exists".into()));
    }
    fs::create_dir_all(path).await?;
    set_permissions(path, target).await?;
    Ok(None)
}

#[cfg(unix)]
async fn write_symlink(
    action: &FileSystemAction,
    path: &Path,
    digest: DigestAlgorithm,
) -> ReplResult<Option<String>> {
    let target = target_of(action)?;
    let link = target
        .link_target
        .as_deref()
        .ok_or_else(|| ReplError::InvalidFileVersion {
            history: target.history.to_string(),
            msg: "symlink version without target".into(),
        })?;
    if let Some(existing) = LocalEntry::load(path, digest)? {
        if existing.matches(target) {
            return Ok(Some("already up to date".into()));
        }
        if existing.file_type == FileType::Folder {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a folder", action.path),
            )
            .into());
        }
        fs::remove_file(path).await?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::symlink(link, path).await?;
    Ok(None)
}

#[cfg(not(unix))]
async fn write_symlink(
    _action: &FileSystemAction,
    _path: &Path,
    _digest: DigestAlgorithm,
) -> ReplResult<Option<String>> {
    Ok(Some("symlinks are not supported on this platform".into()))
}

#[cfg(unix)]
async fn set_permissions(path: &Path, version: &FileVersion) -> ReplResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = version.permissions {
        if version.file_type != FileType::Symlink {
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _version: &FileVersion) -> ReplResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseVersion, FileContent, FileHistoryId, FileStatus, MultiChunkRecord};
    use crate::vector_clock::ReplicaId;
    use async_trait::async_trait;
    use meshsync_reduce::{DedupConfig, DedupEvent, Deduper, MemoryContainerStore};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct MemoryFetcher {
        store: MemoryContainerStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ContentFetcher for MemoryFetcher {
        async fn fetch(&self, id: &MultiChunkId) -> ReplResult<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.store.get(id).cloned().ok_or_else(|| ReplError::MissingContent {
                msg: id.to_string(),
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        db: Database,
        deduper: Deduper,
        fetcher: MemoryFetcher,
    }

    impl Fixture {
        /// Store `files` in containers and record them in a fresh database.
        fn new(files: &[&[u8]]) -> Self {
            let deduper = Deduper::from_config(&DedupConfig::default(), None).unwrap();
            let mut store = MemoryContainerStore::new();
            let mut events: Vec<DedupEvent> = Vec::new();
            let inputs = files
                .iter()
                .enumerate()
                .map(|(i, data)| (PathBuf::from(i.to_string()), Cursor::new(data.to_vec())))
                .collect();
            deduper
                .deduplicate(inputs, &HashSet::<ChunkDigest>::new(), &mut store, &mut events)
                .unwrap();

            let mut db = Database::new(ReplicaId::new("local").unwrap());
            let mut builder = DatabaseVersion::builder(db.next_header(1));
            let mut chunks = Vec::new();
            for event in events {
                match event {
                    DedupEvent::ChunkObserved { digest, .. } => chunks.push(digest),
                    DedupEvent::FileEnded { size, file_digest, .. } => {
                        builder = builder.file_content(FileContent {
                            checksum: file_digest,
                            size,
                            chunks: std::mem::take(&mut chunks),
                        });
                    }
                    DedupEvent::MultiChunkClosed(sealed) => {
                        builder = builder.multichunk(MultiChunkRecord {
                            id: sealed.id,
                            chunks: sealed.chunks,
                        });
                    }
                    _ => {}
                }
            }
            db.apply_local(&builder.build()).unwrap();
            Self {
                dir: TempDir::new().unwrap(),
                db,
                deduper,
                fetcher: MemoryFetcher {
                    store,
                    fetches: AtomicUsize::new(0),
                },
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        async fn run(&self, actions: Vec<FileSystemAction>) -> Vec<ActionOutcome> {
            let mut executor = ActionExecutor::new(
                self.root(),
                ".meshsync",
                &self.db,
                self.deduper.multichunker(),
                &self.fetcher,
                DigestAlgorithm::Blake3,
            );
            executor.execute(actions).await.unwrap()
        }
    }

    fn version(path: &str, file_type: FileType, body: &[u8]) -> FileVersion {
        FileVersion {
            history: FileHistoryId::random(),
            version: 1,
            path: path.into(),
            file_type,
            status: FileStatus::New,
            size: body.len() as u64,
            checksum: (file_type == FileType::File).then(|| DigestAlgorithm::Blake3.digest(body)),
            link_target: None,
            permissions: None,
        }
    }

    fn action(kind: ActionKind, target: &FileVersion) -> FileSystemAction {
        FileSystemAction {
            kind,
            history: Some(target.history),
            file_type: target.file_type,
            path: target.path.clone(),
            from: None,
            target: Some(target.clone()),
        }
    }

    #[tokio::test]
    async fn new_file_is_reassembled_and_reapplying_skips() {
        let body = b"hello from another replica".to_vec();
        let fx = Fixture::new(&[body.as_slice()]);
        let target = version("docs/hello.txt", FileType::File, &body);
        let actions = vec![
            action(ActionKind::New, &version("docs", FileType::Folder, b"")),
            action(ActionKind::New, &target),
        ];

        let outcomes = fx.run(actions.clone()).await;
        assert!(outcomes.iter().all(|o| matches!(o.result, ActionResult::Applied)));
        assert_eq!(std::fs::read(fx.root().join("docs/hello.txt")).unwrap(), body);

        let again = fx.run(actions).await;
        assert!(again.iter().all(|o| matches!(o.result, ActionResult::Skipped(_))));
        assert_eq!(fx.fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_only_that_action() {
        let fx = Fixture::new(&[b"actual bytes".as_slice()]);
        let mut db = fx.db.clone();
        let actual = DigestAlgorithm::Blake3.digest(b"actual bytes");
        let claimed = DigestAlgorithm::Blake3.digest(b"claimed bytes");
        let manifest = db.content(&actual).unwrap().clone();
        db.apply_local(
            &DatabaseVersion::builder(db.next_header(2))
                .file_content(FileContent {
                    checksum: claimed,
                    ..manifest
                })
                .build(),
        )
        .unwrap();

        let bad = version("bad.txt", FileType::File, b"claimed bytes");
        let fine = version("fine", FileType::Folder, b"");
        let mut executor = ActionExecutor::new(
            fx.root(),
            ".meshsync",
            &db,
            fx.deduper.multichunker(),
            &fx.fetcher,
            DigestAlgorithm::Blake3,
        );
        let outcomes = executor
            .execute(vec![action(ActionKind::New, &bad), action(ActionKind::New, &fine)])
            .await
            .unwrap();
        assert!(matches!(
            outcomes[0].result,
            ActionResult::Failed(ReplError::ChecksumMismatch { .. })
        ));
        assert!(matches!(outcomes[1].result, ActionResult::Applied));
        assert!(!fx.root().join("bad.txt").exists());
        assert!(fx.root().join("fine").is_dir());
        let tmp_entries = std::fs::read_dir(fx.root().join(".meshsync/tmp")).unwrap().count();
        assert_eq!(tmp_entries, 0);
    }

    #[tokio::test]
    async fn deletes_respect_local_changes_and_non_empty_folders() {
        let fx = Fixture::new(&[]);
        std::fs::create_dir_all(fx.root().join("dir")).unwrap();
        std::fs::write(fx.root().join("dir/kept"), b"edited").unwrap();
        std::fs::write(fx.root().join("gone"), b"old").unwrap();

        let outcomes = fx
            .run(vec![
                action(ActionKind::Deleted, &version("gone", FileType::File, b"old")),
                action(ActionKind::Deleted, &version("dir/kept", FileType::File, b"original")),
                action(ActionKind::Deleted, &version("dir", FileType::Folder, b"")),
            ])
            .await;
        assert!(matches!(outcomes[0].result, ActionResult::Applied));
        assert!(matches!(outcomes[1].result, ActionResult::Skipped(_)));
        assert!(matches!(outcomes[2].result, ActionResult::Skipped(_)));
        assert!(!fx.root().join("gone").exists());
        assert!(fx.root().join("dir/kept").exists());
    }

    #[tokio::test]
    async fn rename_and_relocation() {
        let fx = Fixture::new(&[]);
        std::fs::write(fx.root().join("a.txt"), b"body").unwrap();
        std::fs::write(fx.root().join("mine.txt"), b"local").unwrap();
        let mut moved = version("b/a.txt", FileType::File, b"body");
        moved.version = 2;
        let rename = FileSystemAction {
            from: Some("a.txt".into()),
            ..action(ActionKind::Renamed, &moved)
        };
        let relocate = FileSystemAction {
            kind: ActionKind::Renamed,
            history: None,
            file_type: FileType::File,
            path: "mine (conflicted copy, local, 0).txt".into(),
            from: Some("mine.txt".into()),
            target: None,
        };

        let outcomes = fx.run(vec![relocate.clone(), rename.clone()]).await;
        assert!(outcomes.iter().all(|o| matches!(o.result, ActionResult::Applied)));
        assert_eq!(std::fs::read(fx.root().join("b/a.txt")).unwrap(), b"body");
        assert!(fx.root().join("mine (conflicted copy, local, 0).txt").exists());

        let again = fx.run(vec![rename]).await;
        assert!(matches!(again[0].result, ActionResult::Skipped(_)));
    }

    #[tokio::test]
    async fn leftover_scratch_files_are_removed() {
        let fx = Fixture::new(&[]);
        let tmp = fx.root().join(".meshsync/tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("stale.part"), b"half").unwrap();
        fx.run(Vec::new()).await;
        assert!(!tmp.join("stale.part").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_and_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let body = b"#!/bin/sh\n".to_vec();
        let fx = Fixture::new(&[body.as_slice()]);
        let mut script = version("run.sh", FileType::File, &body);
        script.permissions = Some(0o755);
        let mut link = version("latest", FileType::Symlink, b"");
        link.link_target = Some("run.sh".into());

        let outcomes = fx
            .run(vec![action(ActionKind::New, &script), action(ActionKind::New, &link)])
            .await;
        assert!(outcomes.iter().all(|o| matches!(o.result, ActionResult::Applied)));
        let mode = std::fs::metadata(fx.root().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read_link(fx.root().join("latest")).unwrap(),
            PathBuf::from("run.sh")
        );
    }
}
