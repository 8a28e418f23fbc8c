//! Snapshot of the local sync root.

use crate::error::ReplResult;
use crate::model::{FileType, FileVersion};
use ignore::WalkBuilder;
use meshsync_reduce::{ChunkDigest, DigestAlgorithm};
use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path};
use tracing::{debug, warn};

/// One entry found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Entry kind; symlinks are not followed.
    pub file_type: FileType,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Whole-file digest, files only.
    pub checksum: Option<ChunkDigest>,
    /// Symlink target.
    pub link_target: Option<String>,
    /// Permission bits on unix.
    pub permissions: Option<u32>,
}

impl LocalEntry {
    /// Read one entry; `Ok(None)` if nothing exists at `path`.
    pub fn load(path: &Path, digest: DigestAlgorithm) -> io::Result<Option<LocalEntry>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Folder
        } else {
            FileType::File
        };
        let entry = match file_type {
            FileType::File => LocalEntry {
                file_type,
                size: meta.len(),
                checksum: Some(hash_file(path, digest)?),
                link_target: None,
                permissions: permissions(&meta),
            },
            FileType::Folder => LocalEntry {
                file_type,
                size: 0,
                checksum: None,
                link_target: None,
                permissions: permissions(&meta),
            },
            FileType::Symlink => LocalEntry {
                file_type,
                size: 0,
                checksum: None,
                link_target: Some(fs::read_link(path)?.to_string_lossy().into_owned()),
                permissions: None,
            },
        };
        Ok(Some(entry))
    }

    /// Same type and content as `version`; attributes are not compared.
    pub fn matches(&self, version: &FileVersion) -> bool {
        self.file_type == version.file_type
            && match self.file_type {
                FileType::File => self.checksum == version.checksum,
                FileType::Symlink => self.link_target == version.link_target,
                FileType::Folder => true,
            }
    }

    /// Permission bits agree, or one side does not record them.
    pub fn attributes_match(&self, version: &FileVersion) -> bool {
        match (self.permissions, version.permissions) {
            (Some(a), Some(b)) => self.file_type == FileType::Symlink || a == b,
            _ => true,
        }
    }
}

#[cfg(unix)]
fn permissions(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions(_meta: &Metadata) -> Option<u32> {
    None
}

/// Digest a file's full contents.
pub fn hash_file(path: &Path, digest: DigestAlgorithm) -> io::Result<ChunkDigest> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = digest.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// True for a relative `/`-separated path with no empty, `.` or `..` components that
/// does not enter the state directory.
pub fn is_safe_path(path: &str, state_dir: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    let mut parts = path.split('/');
    if parts.clone().next() == Some(state_dir) {
        return false;
    }
    parts.all(|p| !p.is_empty() && p != "." && p != "..")
}

/// Every entry under a sync root, keyed by relative `/`-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTree {
    entries: BTreeMap<String, LocalEntry>,
}

impl LocalTree {
    /// Walk `root` without ignore rules, without following symlinks, skipping the
    /// top-level `ignore_dir`.
    pub fn scan(root: &Path, digest: DigestAlgorithm, ignore_dir: &str) -> ReplResult<Self> {
        let skip = root.join(ignore_dir);
        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .filter_entry(move |e| e.path() != skip);

        let mut entries = BTreeMap::new();
        for result in builder.build() {
            let entry = result.map_err(walk_error)?;
            if entry.depth() == 0 {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                warn!(path = %entry.path().display(), "skipping entry with non UTF-8 name");
                continue;
            };
            // vanished between listing and reading
            let Some(local) = LocalEntry::load(entry.path(), digest)? else {
                continue;
            };
            entries.insert(rel, local);
        }
        debug!(root = %root.display(), entries = entries.len(), "scanned local tree");
        Ok(Self { entries })
    }

    /// Build from explicit entries.
    pub fn from_entries(entries: BTreeMap<String, LocalEntry>) -> Self {
        Self { entries }
    }

    /// Entry at `path`.
    pub fn get(&self, path: &str) -> Option<&LocalEntry> {
        self.entries.get(path)
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LocalEntry)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the root is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn walk_error(err: ignore::Error) -> io::Error {
    let msg = err.to_string();
    err.into_io_error().unwrap_or_else(|| io::Error::other(msg))
}
