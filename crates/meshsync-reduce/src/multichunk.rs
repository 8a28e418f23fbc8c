//! Multichunk containers: new chunks packed into randomly identified, sealed containers.
//!
//! Payload layout before transforms: `MSMC`, one format version byte, then one record per
//! chunk: digest length (u8), digest, data length (u32 LE), data.

use crate::chunker::Chunk;
use crate::digest::ChunkDigest;
use crate::encryption::EncryptionKey;
use crate::error::{ReduceError, ReduceResult};
use crate::transform::{TransformConfig, Transformer};
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Container magic
pub const MULTICHUNK_MAGIC: &[u8; 4] = b"MSMC";
/// Container format version
pub const MULTICHUNK_VERSION: u8 = 1;
/// Default container capacity: 4 MiB of chunk data
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;
/// Prefix of container file names, locally and on remotes
pub const MULTICHUNK_FILE_PREFIX: &str = "multichunk-";

/// Random 128-bit container identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MultiChunkId(pub [u8; 16]);

impl MultiChunkId {
    /// Generate a fresh random id. Ids are never derived from container contents.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse the 32-character hex form
    pub fn from_hex(s: &str) -> ReduceResult<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(ReduceError::CorruptContainer(format!("bad container id {s:?}")));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ReduceError::CorruptContainer(format!("bad container id {s:?}")))?;
        }
        Ok(Self(out))
    }

    /// `multichunk-<hex>`
    pub fn file_name(&self) -> String {
        format!("{}{}", MULTICHUNK_FILE_PREFIX, self.to_hex())
    }

    /// Inverse of [`MultiChunkId::file_name`]
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(MULTICHUNK_FILE_PREFIX)
            .and_then(|hex| Self::from_hex(hex).ok())
    }
}

impl fmt::Display for MultiChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for MultiChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MultiChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MultiChunkId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One chunk stored in a sealed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkEntry {
    /// Chunk identity
    pub digest: ChunkDigest,
    /// Uncompressed chunk size
    pub size: u32,
}

/// Result of sealing a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMultiChunk {
    /// Container id
    pub id: MultiChunkId,
    /// Member chunks in write order
    pub chunks: Vec<MultiChunkEntry>,
    /// Sum of member chunk sizes
    pub size: u64,
    /// Bytes written to the sink after transforms
    pub stored_size: u64,
}

/// Container packing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiChunkConfig {
    /// A container reports full once its chunk data reaches this many bytes
    pub capacity: usize,
    /// Transforms applied to the sealed payload
    pub transform: TransformConfig,
}

impl Default for MultiChunkConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            transform: TransformConfig::default(),
        }
    }
}

impl MultiChunkConfig {
    /// Reject a zero capacity
    pub fn validate(&self) -> ReduceResult<()> {
        if self.capacity == 0 {
            return Err(ReduceError::InvalidConfig(
                "multichunk capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Factory for container writers and reader for sealed containers
#[derive(Debug, Clone)]
pub struct MultiChunker {
    capacity: usize,
    transformer: Transformer,
}

impl MultiChunker {
    /// Create from config; encryption requires `master_key`
    pub fn new(config: &MultiChunkConfig, master_key: Option<EncryptionKey>) -> ReduceResult<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity,
            transformer: Transformer::new(config.transform, master_key)?,
        })
    }

    /// Container capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open a container writing to `sink`
    pub fn create_container<W: Write>(&self, id: MultiChunkId, sink: W) -> MultiChunkWriter<W> {
        let mut payload = Vec::with_capacity(self.capacity.min(DEFAULT_CAPACITY) + 64);
        payload.extend_from_slice(MULTICHUNK_MAGIC);
        payload.push(MULTICHUNK_VERSION);
        debug!(container = %id, capacity = self.capacity, "opened multichunk");
        MultiChunkWriter {
            id,
            capacity: self.capacity,
            transformer: self.transformer.clone(),
            payload,
            chunks: Vec::new(),
            size: 0,
            sealed: false,
            sink,
        }
    }

    /// Reverse the transforms of a stored container and index its chunks by digest
    pub fn read_container(
        &self,
        id: &MultiChunkId,
        stored: &[u8],
    ) -> ReduceResult<BTreeMap<ChunkDigest, Bytes>> {
        let payload = self.transformer.reverse(&id.0, stored)?;
        read_multichunk(&payload)
    }
}

/// Parse an untransformed container payload
pub fn read_multichunk(payload: &[u8]) -> ReduceResult<BTreeMap<ChunkDigest, Bytes>> {
    let corrupt = |msg: &str| ReduceError::CorruptContainer(msg.to_string());
    if payload.len() < 5 || &payload[..4] != MULTICHUNK_MAGIC {
        return Err(corrupt("missing container magic"));
    }
    if payload[4] != MULTICHUNK_VERSION {
        return Err(ReduceError::CorruptContainer(format!(
            "unsupported container version {}",
            payload[4]
        )));
    }

    let mut chunks = BTreeMap::new();
    let mut pos = 5;
    while pos < payload.len() {
        let digest_len = payload[pos] as usize;
        pos += 1;
        if digest_len != 32 {
            return Err(ReduceError::CorruptContainer(format!(
                "unexpected digest length {digest_len}"
            )));
        }
        let digest_bytes = payload
            .get(pos..pos + 32)
            .ok_or_else(|| corrupt("truncated digest"))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(digest_bytes);
        pos += 32;

        let len_bytes = payload
            .get(pos..pos + 4)
            .ok_or_else(|| corrupt("truncated record length"))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        pos += 4;

        let data = payload
            .get(pos..pos + len)
            .ok_or_else(|| corrupt("truncated chunk data"))?;
        pos += len;

        if chunks
            .insert(ChunkDigest(digest), Bytes::copy_from_slice(data))
            .is_some()
        {
            return Err(ReduceError::CorruptContainer(format!(
                "duplicate chunk {}",
                ChunkDigest(digest)
            )));
        }
    }
    Ok(chunks)
}

/// Handle on one open container. Owned by a single deduplication run.
pub struct MultiChunkWriter<W> {
    id: MultiChunkId,
    capacity: usize,
    transformer: Transformer,
    payload: Vec<u8>,
    chunks: Vec<MultiChunkEntry>,
    size: u64,
    sealed: bool,
    sink: W,
}

impl<W: Write> MultiChunkWriter<W> {
    /// Container id
    pub fn id(&self) -> MultiChunkId {
        self.id
    }

    /// Number of chunks written
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True once accumulated size reaches capacity
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity as u64
    }

    /// True after [`MultiChunkWriter::close`]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn sealed_error(&self) -> ReduceError {
        ReduceError::ContainerSealed {
            id: self.id.to_hex(),
        }
    }

    /// Append a chunk record
    pub fn write(&mut self, chunk: &Chunk) -> ReduceResult<()> {
        if self.sealed {
            return Err(self.sealed_error());
        }
        let len = u32::try_from(chunk.data.len()).map_err(|_| {
            ReduceError::InvalidConfig(format!("chunk of {} bytes too large", chunk.data.len()))
        })?;
        self.payload.push(32);
        self.payload.extend_from_slice(chunk.digest.as_bytes());
        self.payload.extend_from_slice(&len.to_le_bytes());
        self.payload.extend_from_slice(&chunk.data);
        self.chunks.push(MultiChunkEntry {
            digest: chunk.digest,
            size: len,
        });
        self.size += len as u64;
        Ok(())
    }

    /// Apply transforms, write and flush the sink, and make the container immutable
    pub fn close(&mut self) -> ReduceResult<SealedMultiChunk> {
        if self.sealed {
            return Err(self.sealed_error());
        }
        let stored = self.transformer.apply(&self.id.0, &self.payload)?;
        self.sink.write_all(&stored)?;
        self.sink.flush()?;
        self.sealed = true;
        self.payload = Vec::new();
        debug!(
            container = %self.id,
            chunks = self.chunks.len(),
            size = self.size,
            stored_size = stored.len(),
            "sealed multichunk"
        );
        Ok(SealedMultiChunk {
            id: self.id,
            chunks: self.chunks.clone(),
            size: self.size,
            stored_size: stored.len() as u64,
        })
    }

    /// Give back the sink, for committing or discarding it
    pub fn into_sink(self) -> W {
        self.sink
    }
}

/// Where container sinks come from and where sealed containers end up
pub trait ContainerStore {
    /// Sink type handed to the container writer
    type Sink: Write;

    /// Prepare a sink for a new container
    fn create_sink(&mut self, id: &MultiChunkId) -> ReduceResult<Self::Sink>;

    /// Publish a sealed container
    fn commit(&mut self, id: &MultiChunkId, sink: Self::Sink) -> ReduceResult<()>;

    /// Drop an unsealed container entirely
    fn discard(&mut self, id: &MultiChunkId, sink: Self::Sink) -> ReduceResult<()>;
}

/// In-memory store, for tests and small runs
#[derive(Debug, Default)]
pub struct MemoryContainerStore {
    containers: BTreeMap<MultiChunkId, Bytes>,
}

impl MemoryContainerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes of a committed container
    pub fn get(&self, id: &MultiChunkId) -> Option<&Bytes> {
        self.containers.get(id)
    }

    /// Number of committed containers
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// True if nothing was committed
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl ContainerStore for MemoryContainerStore {
    type Sink = Vec<u8>;

    fn create_sink(&mut self, _id: &MultiChunkId) -> ReduceResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn commit(&mut self, id: &MultiChunkId, sink: Vec<u8>) -> ReduceResult<()> {
        self.containers.insert(*id, Bytes::from(sink));
        Ok(())
    }

    fn discard(&mut self, _id: &MultiChunkId, _sink: Vec<u8>) -> ReduceResult<()> {
        Ok(())
    }
}

/// Stores containers as files: `<id>.tmp` while open, `multichunk-<id>` once committed
#[derive(Debug, Clone)]
pub struct DirectoryContainerStore {
    dir: PathBuf,
}

impl DirectoryContainerStore {
    /// Use (and create) `dir`
    pub fn new(dir: impl Into<PathBuf>) -> ReduceResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the containers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a committed container
    pub fn path_for(&self, id: &MultiChunkId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    fn temp_path(&self, id: &MultiChunkId) -> PathBuf {
        self.dir.join(format!("{}.tmp", id.to_hex()))
    }

    /// Read a committed container's stored bytes
    pub fn read(&self, id: &MultiChunkId) -> ReduceResult<Vec<u8>> {
        Ok(fs::read(self.path_for(id))?)
    }

    /// Ids of all committed containers
    pub fn list(&self) -> ReduceResult<Vec<MultiChunkId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(MultiChunkId::from_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl ContainerStore for DirectoryContainerStore {
    type Sink = BufWriter<File>;

    fn create_sink(&mut self, id: &MultiChunkId) -> ReduceResult<Self::Sink> {
        Ok(BufWriter::new(File::create(self.temp_path(id))?))
    }

    fn commit(&mut self, id: &MultiChunkId, sink: Self::Sink) -> ReduceResult<()> {
        let temp = self.temp_path(id);
        let result = sink
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|()| fs::rename(&temp, self.path_for(id)));
        if let Err(e) = result {
            warn!(container = %id, error = %e, "commit failed, removing partial multichunk");
            if let Err(rm) = fs::remove_file(&temp) {
                debug!(path = %temp.display(), error = %rm, "partial multichunk already gone");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn discard(&mut self, id: &MultiChunkId, sink: Self::Sink) -> ReduceResult<()> {
        drop(sink);
        let path = self.temp_path(id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove discarded multichunk");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
