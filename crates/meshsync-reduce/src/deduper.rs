//! Deduplication run: chunk each file, ask the oracle which chunks are new, and pack new
//! chunks into multichunk containers.
//!
//! The run only emits [`DedupEvent`]s. Persisting chunk, container and manifest records is
//! the listener's job, and a listener must mark chunks known only after it has seen the
//! [`DedupEvent::MultiChunkClosed`] for their container.

use crate::chunker::Chunker;
use crate::config::DedupConfig;
use crate::digest::ChunkDigest;
use crate::encryption::EncryptionKey;
use crate::error::ReduceResult;
use crate::index::ChunkIndex;
use crate::multichunk::{ContainerStore, MultiChunkId, MultiChunkWriter, MultiChunker, SealedMultiChunk};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Optional per-run limits; the run stops before the next file once one is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionLimits {
    /// Maximum new chunk bytes per run, counted before compression and encryption
    pub max_total_size: Option<u64>,
    /// Maximum number of files per run
    pub max_files: Option<usize>,
}

/// Lifecycle events, in emission order for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupEvent {
    /// Run begins over this many candidate files
    RunStarted {
        /// Number of files offered
        files: usize,
    },
    /// A file is about to be chunked
    FileStarted {
        /// File path as given by the caller
        path: PathBuf,
    },
    /// A chunk was produced, new or duplicate, in file order
    ChunkObserved {
        /// Chunk identity
        digest: ChunkDigest,
        /// Chunk size
        size: usize,
        /// Offset in the file
        offset: u64,
        /// False if the index already knows it or this run already wrote it
        is_new: bool,
    },
    /// A container was opened
    MultiChunkOpened {
        /// Container id
        id: MultiChunkId,
    },
    /// A new chunk was written into the open container
    ChunkWrittenToMultiChunk {
        /// Container id
        id: MultiChunkId,
        /// Chunk identity
        digest: ChunkDigest,
    },
    /// A container was sealed and committed
    MultiChunkClosed(SealedMultiChunk),
    /// An open container was thrown away after a failure
    MultiChunkDiscarded {
        /// Container id
        id: MultiChunkId,
    },
    /// A file was fully chunked
    FileEnded {
        /// File path as given by the caller
        path: PathBuf,
        /// File size in bytes
        size: u64,
        /// Whole-file digest
        file_digest: ChunkDigest,
    },
    /// Run completed
    RunFinished(DedupSummary),
}

/// Receives deduplication events
pub trait DedupListener {
    /// Handle one event
    fn on_event(&mut self, event: DedupEvent);
}

impl DedupListener for Vec<DedupEvent> {
    fn on_event(&mut self, event: DedupEvent) {
        self.push(event);
    }
}

/// Totals for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupSummary {
    /// Files consumed (possibly fewer than offered when a limit was hit)
    pub files: usize,
    /// Chunks observed
    pub chunks: usize,
    /// Chunks written to containers
    pub new_chunks: usize,
    /// Bytes observed
    pub total_bytes: u64,
    /// Bytes written to containers, before transforms
    pub new_bytes: u64,
    /// Sealed containers, in sealing order
    pub containers: Vec<SealedMultiChunk>,
    /// True if a transaction limit ended the run early
    pub limit_reached: bool,
}

impl DedupSummary {
    /// Chunks that were already known
    pub fn duplicate_chunks(&self) -> usize {
        self.chunks - self.new_chunks
    }

    /// Stored container bytes, after transforms
    pub fn stored_bytes(&self) -> u64 {
        self.containers.iter().map(|c| c.stored_size).sum()
    }
}

struct Run<'a, S: ContainerStore, L: ?Sized> {
    index: &'a dyn ChunkIndex,
    store: &'a mut S,
    listener: &'a mut L,
    open: Option<MultiChunkWriter<S::Sink>>,
    written: HashSet<ChunkDigest>,
    summary: DedupSummary,
}

/// The dedup engine's public face
#[derive(Debug, Clone)]
pub struct Deduper {
    chunker: Chunker,
    multichunker: MultiChunker,
    limits: TransactionLimits,
}

impl Deduper {
    /// Combine a chunker and a multichunker, without limits
    pub fn new(chunker: Chunker, multichunker: MultiChunker) -> Self {
        Self {
            chunker,
            multichunker,
            limits: TransactionLimits::default(),
        }
    }

    /// Build from validated configuration
    pub fn from_config(config: &DedupConfig, master_key: Option<EncryptionKey>) -> ReduceResult<Self> {
        config.validate()?;
        let chunker = Chunker::new(config.chunker.clone(), config.digest)?;
        let multichunker = MultiChunker::new(&config.multichunk, master_key)?;
        Ok(Self::new(chunker, multichunker).with_limits(config.limits))
    }

    /// Apply transaction limits
    pub fn with_limits(mut self, limits: TransactionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Chunker in use
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Multichunker in use
    pub fn multichunker(&self) -> &MultiChunker {
        &self.multichunker
    }

    /// Deduplicate files on disk, opening each one only when its turn comes
    pub fn deduplicate_files<S, L>(
        &self,
        paths: &[PathBuf],
        index: &dyn ChunkIndex,
        store: &mut S,
        listener: &mut L,
    ) -> ReduceResult<DedupSummary>
    where
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        let inputs = paths.iter().map(|path| -> ReduceResult<(PathBuf, BufReader<File>)> {
            Ok((path.clone(), BufReader::new(File::open(path)?)))
        });
        self.run(paths.len(), inputs, index, store, listener)
    }

    /// Deduplicate named in-memory or already opened streams
    pub fn deduplicate<R, S, L>(
        &self,
        inputs: Vec<(PathBuf, R)>,
        index: &dyn ChunkIndex,
        store: &mut S,
        listener: &mut L,
    ) -> ReduceResult<DedupSummary>
    where
        R: Read,
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        let count = inputs.len();
        self.run(count, inputs.into_iter().map(Ok), index, store, listener)
    }

    #[instrument(skip(self, inputs, index, store, listener))]
    fn run<I, R, S, L>(
        &self,
        files: usize,
        inputs: I,
        index: &dyn ChunkIndex,
        store: &mut S,
        listener: &mut L,
    ) -> ReduceResult<DedupSummary>
    where
        I: Iterator<Item = ReduceResult<(PathBuf, R)>>,
        R: Read,
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        listener.on_event(DedupEvent::RunStarted { files });
        let mut run = Run {
            index,
            store,
            listener,
            open: None,
            written: HashSet::new(),
            summary: DedupSummary::default(),
        };

        for input in inputs {
            if self.limit_reached(&run) {
                run.summary.limit_reached = true;
                info!(files = run.summary.files, "transaction limit reached, stopping run");
                break;
            }
            let result = input.and_then(|(path, reader)| self.process_file(&mut run, &path, reader));
            if let Err(e) = result {
                self.discard_open(&mut run);
                return Err(e);
            }
        }

        // The last container is sealed even when it holds nothing new.
        if let Err(e) = self.seal_open(&mut run) {
            self.discard_open(&mut run);
            return Err(e);
        }

        let summary = run.summary;
        info!(
            files = summary.files,
            chunks = summary.chunks,
            new_chunks = summary.new_chunks,
            containers = summary.containers.len(),
            "deduplication run finished"
        );
        run.listener.on_event(DedupEvent::RunFinished(summary.clone()));
        Ok(summary)
    }

    fn limit_reached<S: ContainerStore, L: ?Sized>(&self, run: &Run<'_, S, L>) -> bool {
        if let Some(max) = self.limits.max_files {
            if run.summary.files >= max {
                return true;
            }
        }
        if let Some(max) = self.limits.max_total_size {
            if run.summary.new_bytes >= max {
                return true;
            }
        }
        false
    }

    fn process_file<R, S, L>(&self, run: &mut Run<'_, S, L>, path: &Path, reader: R) -> ReduceResult<()>
    where
        R: Read,
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        run.listener.on_event(DedupEvent::FileStarted {
            path: path.to_path_buf(),
        });

        let mut stream = self.chunker.chunks(reader);
        let mut size = 0u64;
        while let Some(chunk) = stream.next() {
            let chunk = chunk?;
            let is_new = !run.written.contains(&chunk.digest) && !run.index.is_known_chunk(&chunk.digest);
            size += chunk.size() as u64;
            run.summary.chunks += 1;
            run.summary.total_bytes += chunk.size() as u64;
            run.listener.on_event(DedupEvent::ChunkObserved {
                digest: chunk.digest,
                size: chunk.size(),
                offset: chunk.offset,
                is_new,
            });
            if !is_new {
                continue;
            }

            if run.open.is_none() {
                let id = MultiChunkId::random();
                let sink = run.store.create_sink(&id)?;
                run.open = Some(self.multichunker.create_container(id, sink));
                run.listener.on_event(DedupEvent::MultiChunkOpened { id });
            }
            if let Some(writer) = run.open.as_mut() {
                writer.write(&chunk)?;
                let id = writer.id();
                let full = writer.is_full();
                run.written.insert(chunk.digest);
                run.summary.new_chunks += 1;
                run.summary.new_bytes += chunk.size() as u64;
                run.listener.on_event(DedupEvent::ChunkWrittenToMultiChunk {
                    id,
                    digest: chunk.digest,
                });
                if full {
                    self.seal_open(run)?;
                }
            }
        }

        let file_digest = stream
            .file_digest()
            .unwrap_or_else(|| self.chunker.digest_algorithm().digest(b""));
        debug!(path = %path.display(), size, file_digest = %file_digest.short(), "file chunked");
        run.summary.files += 1;
        run.listener.on_event(DedupEvent::FileEnded {
            path: path.to_path_buf(),
            size,
            file_digest,
        });
        Ok(())
    }

    fn seal_open<S, L>(&self, run: &mut Run<'_, S, L>) -> ReduceResult<()>
    where
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        let Some(mut writer) = run.open.take() else {
            return Ok(());
        };
        let id = writer.id();
        let sealed = match writer.close() {
            Ok(sealed) => sealed,
            Err(e) => {
                run.open = Some(writer);
                return Err(e);
            }
        };
        run.store.commit(&id, writer.into_sink())?;
        run.listener.on_event(DedupEvent::MultiChunkClosed(sealed.clone()));
        run.summary.containers.push(sealed);
        Ok(())
    }

    fn discard_open<S, L>(&self, run: &mut Run<'_, S, L>)
    where
        S: ContainerStore,
        L: DedupListener + ?Sized,
    {
        if let Some(writer) = run.open.take() {
            let id = writer.id();
            if let Err(e) = run.store.discard(&id, writer.into_sink()) {
                warn!(container = %id, error = %e, "failed to discard open multichunk");
            }
            warn!(container = %id, "discarded unsealed multichunk");
            run.listener.on_event(DedupEvent::MultiChunkDiscarded { id });
        }
    }
}
