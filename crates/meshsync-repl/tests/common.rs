//! Common test fixtures: replicas sharing one directory remote.

#![allow(dead_code)]

use meshsync_reduce::{ChunkDigest, DigestAlgorithm};
use meshsync_repl::{
    DownReport, FileType, LocalDirectoryRemote, LocalTree, ReplicaId, SyncConfig, SyncContext, UpReport,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a test subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// What a replica shows for one path, ignoring attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Folder,
    File(ChunkDigest),
    Link(String),
}

/// A shared remote plus the replicas using it.
pub struct TestMesh {
    dir: TempDir,
    remote: LocalDirectoryRemote,
}

impl TestMesh {
    pub async fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let remote = LocalDirectoryRemote::open(dir.path().join("remote")).await.unwrap();
        Self { dir, remote }
    }

    pub fn remote(&self) -> &LocalDirectoryRemote {
        &self.remote
    }

    /// A fresh replica with an empty root.
    pub fn replica(&self, name: &str) -> TestReplica {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new(ReplicaId::new(name).unwrap(), dir.path());
        let ctx = SyncContext::new(config, None, self.remote.clone()).unwrap();
        TestReplica { dir, ctx }
    }
}

/// One replica and its sync root.
pub struct TestReplica {
    dir: TempDir,
    pub ctx: SyncContext<LocalDirectoryRemote>,
}

impl TestReplica {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, body: &[u8]) {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, body).unwrap();
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        fs::read(self.root().join(path)).ok()
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.root().join(path)).unwrap();
    }

    pub fn rename(&self, from: &str, to: &str) {
        let to = self.root().join(to);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::rename(self.root().join(from), to).unwrap();
    }

    /// Every path under the root except the state directory.
    pub fn snapshot(&self) -> BTreeMap<String, Seen> {
        LocalTree::scan(self.root(), DigestAlgorithm::Blake3, ".meshsync")
            .unwrap()
            .iter()
            .map(|(path, entry)| {
                let seen = match entry.file_type {
                    FileType::Folder => Seen::Folder,
                    FileType::File => Seen::File(entry.checksum.unwrap()),
                    FileType::Symlink => Seen::Link(entry.link_target.clone().unwrap()),
                };
                (path.clone(), seen)
            })
            .collect()
    }

    /// Paths whose name marks them as conflict copies.
    pub fn conflict_copies(&self) -> Vec<String> {
        self.snapshot()
            .into_keys()
            .filter(|p| p.contains("(conflicted copy"))
            .collect()
    }

    pub async fn up(&mut self) -> UpReport {
        self.ctx.up().await.unwrap()
    }

    /// Down pass that must succeed completely.
    pub async fn down(&mut self) -> DownReport {
        let report = self.ctx.down().await.unwrap();
        assert!(report.committed, "down pass failed: {:?}", report.outcomes);
        report
    }

    /// Publish local changes, then merge remote ones.
    pub async fn sync(&mut self) {
        self.up().await;
        self.down().await;
    }
}
