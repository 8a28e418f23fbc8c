#![warn(missing_docs)]

//! meshsync reduction subsystem: rolling fingerprints, TTTD chunking, multichunk packing, deduplication
//!
//! Write path: File → Chunk (fixed/TTTD/sniffed) → Digest → Dedupe → Pack → Compress → Encrypt → Container
//! Read path:  Container → Decrypt → Decompress → Chunks

pub mod chunker;
pub mod compression;
pub mod config;
pub mod deduper;
pub mod digest;
pub mod encryption;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod multichunk;
pub mod transform;

pub use chunker::{Chunk, ChunkStream, Chunker, ChunkerConfig, ContentClass, SniffingConfig, TttdConfig};
pub use compression::CompressionAlgorithm;
pub use config::DedupConfig;
pub use deduper::{DedupEvent, DedupListener, DedupSummary, Deduper, TransactionLimits};
pub use digest::{ChunkDigest, DigestAlgorithm, DigestHasher};
pub use encryption::{EncryptionAlgorithm, EncryptionKey};
pub use error::{ReduceError, ReduceResult};
pub use fingerprint::{FingerprintAlgorithm, Fingerprinter, RollingChecksum};
pub use index::{ChunkIndex, MemoryChunkIndex};
pub use multichunk::{
    read_multichunk, ContainerStore, DirectoryContainerStore, MemoryContainerStore, MultiChunkConfig,
    MultiChunkEntry, MultiChunkId, MultiChunkWriter, MultiChunker, SealedMultiChunk,
};
pub use transform::{TransformConfig, Transformer};
