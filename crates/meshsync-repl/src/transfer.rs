//! Collaborator interfaces for moving containers and database versions, and a remote
//! backed by a plain directory.
//!
//! Layout of a directory remote:
//!
//! ```text
//! <root>/databases/db-<replica>-<sequence:010>
//! <root>/multichunks/multichunk-<hex id>
//! ```

use crate::document::{database_file_name, parse_database_file_name};
use crate::error::{ReplError, ReplResult};
use crate::model::{DatabaseVersion, DatabaseVersionId};
use async_trait::async_trait;
use bytes::Bytes;
use meshsync_reduce::MultiChunkId;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Subdirectory holding database version documents.
pub const DATABASES_DIR: &str = "databases";
/// Subdirectory holding containers.
pub const MULTICHUNKS_DIR: &str = "multichunks";

/// Retrieves stored containers.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Stored (transformed) bytes of a container.
    async fn fetch(&self, id: &MultiChunkId) -> ReplResult<Bytes>;
}

/// Lists and retrieves database versions published by all replicas.
#[async_trait]
pub trait MetadataExchange: Send + Sync {
    /// Every published version id; per replica, in sequence order.
    async fn list_remote_database_versions(&self) -> ReplResult<Vec<DatabaseVersionId>>;

    /// One published version.
    async fn fetch_database_version(&self, id: &DatabaseVersionId) -> ReplResult<DatabaseVersion>;
}

/// Publishes containers and database versions.
#[async_trait]
pub trait RemoteUpload: Send + Sync {
    /// Store a sealed container.
    async fn upload_multichunk(&self, id: &MultiChunkId, data: Bytes) -> ReplResult<()>;

    /// Publish a database version. Its containers must already be uploaded.
    async fn upload_database_version(&self, version: &DatabaseVersion) -> ReplResult<()>;
}

/// A remote that is a directory on a locally mounted file system.
#[derive(Debug, Clone)]
pub struct LocalDirectoryRemote {
    root: PathBuf,
}

impl LocalDirectoryRemote {
    /// Open or create a remote at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> ReplResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(DATABASES_DIR)).await?;
        fs::create_dir_all(root.join(MULTICHUNKS_DIR)).await?;
        Ok(Self { root })
    }

    /// Remote root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of every stored container.
    pub async fn list_multichunks(&self) -> ReplResult<Vec<MultiChunkId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(self.root.join(MULTICHUNKS_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(MultiChunkId::from_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn database_path(&self, id: &DatabaseVersionId) -> PathBuf {
        self.root.join(DATABASES_DIR).join(database_file_name(id))
    }

    fn multichunk_path(&self, id: &MultiChunkId) -> PathBuf {
        self.root.join(MULTICHUNKS_DIR).join(id.file_name())
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> ReplResult<()> {
        let tmp = path.with_extension("part");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentFetcher for LocalDirectoryRemote {
    async fn fetch(&self, id: &MultiChunkId) -> ReplResult<Bytes> {
        match fs::read(self.multichunk_path(id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ReplError::MissingContent {
                msg: format!("container {} is not on the remote", id),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MetadataExchange for LocalDirectoryRemote {
    async fn list_remote_database_versions(&self) -> ReplResult<Vec<DatabaseVersionId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(self.root.join(DATABASES_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            match entry.file_name().to_str().and_then(parse_database_file_name) {
                Some(id) => ids.push(id),
                None => debug!(name = ?entry.file_name(), "ignoring foreign remote file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn fetch_database_version(&self, id: &DatabaseVersionId) -> ReplResult<DatabaseVersion> {
        let bytes = fs::read(self.database_path(id)).await?;
        let version = DatabaseVersion::from_document(&bytes)?;
        if &version.id() != id {
            return Err(ReplError::MalformedRemote {
                msg: format!("{} contains version {}", database_file_name(id), version.id()),
            });
        }
        Ok(version)
    }
}

#[async_trait]
impl RemoteUpload for LocalDirectoryRemote {
    async fn upload_multichunk(&self, id: &MultiChunkId, data: Bytes) -> ReplResult<()> {
        let path = self.multichunk_path(id);
        Self::write_atomic(&path, &data).await?;
        debug!(container = %id, bytes = data.len(), "uploaded multichunk");
        Ok(())
    }

    async fn upload_database_version(&self, version: &DatabaseVersion) -> ReplResult<()> {
        let id = version.id();
        let document = version.to_document()?;
        Self::write_atomic(&self.database_path(&id), &document).await?;
        debug!(version = %id, bytes = document.len(), "uploaded database version");
        Ok(())
    }
}
