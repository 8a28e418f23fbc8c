//! Chunking: fixed-size, content-defined (TTTD), and signature-sniffing dispatch.
//!
//! A [`ChunkStream`] is a lazy, single-pass iterator over one input stream. Once it
//! returns `None` (or an error) it is exhausted for good and keeps returning `None`.

use crate::digest::{ChunkDigest, DigestAlgorithm, DigestHasher};
use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::{FingerprintAlgorithm, Fingerprinter, RollingChecksum};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::iter::FusedIterator;
use tracing::{debug, trace};

/// Sliding window used by TTTD, as in LBFS
pub const DEFAULT_WINDOW_SIZE: usize = 48;
/// Default TTTD average chunk size
pub const DEFAULT_AVERAGE_SIZE: usize = 16 * 1024;
/// Default fixed chunk size
pub const DEFAULT_FIXED_SIZE: usize = 64 * 1024;
/// Number of leading bytes inspected by the sniffing chunker
pub const SNIFF_LEN: usize = 128;

/// An immutable, content-addressed piece of a file
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// Digest of `data`; the chunk's identity
    pub digest: ChunkDigest,
    /// Byte offset of this chunk in its file
    pub offset: u64,
    /// Whole-file digest, set only on the chunk that completes the file
    pub file_digest: Option<ChunkDigest>,
}

impl Chunk {
    /// Chunk length in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Two-threshold two-divisor parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TttdConfig {
    /// Minimum chunk size; no boundary is declared before it
    pub min_size: usize,
    /// Maximum chunk size; a cut is forced here
    pub max_size: usize,
    /// Main divisor D: boundary where `value % D == 0`
    pub main_divisor: u32,
    /// Backup divisor D' < D, remembered as fallback boundary
    pub backup_divisor: u32,
    /// Fingerprint window size
    pub window_size: usize,
    /// Rolling fingerprint used to find boundaries
    #[serde(default)]
    pub fingerprint: FingerprintAlgorithm,
}

impl TttdConfig {
    /// Scale the TTTD paper's measured optimum (460/2800/540/270 for a 1015 byte
    /// average) to the requested average chunk size.
    pub fn with_average(avg: usize) -> Self {
        let scale = |v: f64| ((v * avg as f64 / 1015.0).round() as usize).max(1);
        let min_size = scale(460.0);
        Self {
            min_size,
            max_size: scale(2800.0).max(min_size + 1),
            main_divisor: scale(540.0) as u32,
            backup_divisor: scale(270.0) as u32,
            window_size: DEFAULT_WINDOW_SIZE.min(min_size),
            fingerprint: FingerprintAlgorithm::default(),
        }
    }

    /// Use a different rolling fingerprint
    pub fn with_fingerprint(mut self, fingerprint: FingerprintAlgorithm) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Reject parameter sets that cannot produce bounded chunks
    pub fn validate(&self) -> ReduceResult<()> {
        if self.window_size == 0 || self.window_size > self.min_size {
            return Err(ReduceError::InvalidConfig(format!(
                "TTTD window size {} must be in 1..={}",
                self.window_size, self.min_size
            )));
        }
        if self.max_size <= self.min_size {
            return Err(ReduceError::InvalidConfig(format!(
                "TTTD max size {} must exceed min size {}",
                self.max_size, self.min_size
            )));
        }
        if self.main_divisor == 0 || self.backup_divisor == 0 {
            return Err(ReduceError::InvalidConfig("TTTD divisors must be non-zero".into()));
        }
        if self.backup_divisor >= self.main_divisor {
            return Err(ReduceError::InvalidConfig(format!(
                "TTTD backup divisor {} must be smaller than main divisor {}",
                self.backup_divisor, self.main_divisor
            )));
        }
        Ok(())
    }
}

impl Default for TttdConfig {
    fn default() -> Self {
        Self::with_average(DEFAULT_AVERAGE_SIZE)
    }
}

/// Kind of content recognised from a stream's leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    /// Office containers and PDF
    Document,
    /// JPEG and PNG
    Image,
    /// MKV, AVI, MPEG, MP4
    Video,
    /// ZIP, GZIP, 7z, RAR, XZ, BZip2
    Archive,
    /// Anything else
    Other,
}

/// One fixed run of bytes at a fixed offset
type MagicPart = (usize, &'static [u8]);

/// Ordered: office containers are ZIP files, so they must match before ZIP.
const SIGNATURES: &[(ContentClass, &[MagicPart])] = &[
    (ContentClass::Document, &[(0, &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1])]),
    (ContentClass::Document, &[(0, &[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x06, 0x00])]),
    (
        ContentClass::Document,
        &[
            (0, b"PK\x03\x04"),
            (30, b"mimetypeapplication/vnd.oasis.opendocument"),
        ],
    ),
    (ContentClass::Document, &[(0, b"%PDF")]),
    (ContentClass::Image, &[(0, &[0xFF, 0xD8, 0xFF])]),
    (ContentClass::Image, &[(0, &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])]),
    (ContentClass::Video, &[(0, &[0x1A, 0x45, 0xDF, 0xA3])]),
    (ContentClass::Video, &[(0, b"RIFF"), (8, b"AVI ")]),
    (ContentClass::Video, &[(0, &[0x00, 0x00, 0x01, 0xBA])]),
    (ContentClass::Video, &[(0, &[0x00, 0x00, 0x01, 0xB3])]),
    (ContentClass::Video, &[(4, b"ftyp")]),
    (ContentClass::Archive, &[(0, b"PK\x03\x04")]),
    (ContentClass::Archive, &[(0, &[0x1F, 0x8B])]),
    (ContentClass::Archive, &[(0, &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C])]),
    (ContentClass::Archive, &[(0, b"Rar!\x1A\x07")]),
    (ContentClass::Archive, &[(0, &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00])]),
    (ContentClass::Archive, &[(0, b"BZh")]),
];

impl ContentClass {
    /// Classify a stream by its leading bytes
    pub fn sniff(prefix: &[u8]) -> Self {
        SIGNATURES
            .iter()
            .find(|(_, parts)| {
                parts.iter().all(|(offset, magic)| {
                    prefix
                        .get(*offset..offset + magic.len())
                        .is_some_and(|window| window == *magic)
                })
            })
            .map(|(class, _)| *class)
            .unwrap_or(ContentClass::Other)
    }
}

/// Per-content-class TTTD profiles for the sniffing chunker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniffingConfig {
    /// Profile for unrecognised content
    pub default: TttdConfig,
    /// Office documents and PDF
    pub document: TttdConfig,
    /// Already-compressed images
    pub image: TttdConfig,
    /// Video containers
    pub video: TttdConfig,
    /// Compressed archives
    pub archive: TttdConfig,
}

impl Default for SniffingConfig {
    fn default() -> Self {
        Self {
            default: TttdConfig::with_average(16 * 1024),
            document: TttdConfig::with_average(8 * 1024),
            image: TttdConfig::with_average(64 * 1024),
            video: TttdConfig::with_average(256 * 1024),
            archive: TttdConfig::with_average(128 * 1024),
        }
    }
}

impl SniffingConfig {
    /// Profile for a content class
    pub fn profile(&self, class: ContentClass) -> &TttdConfig {
        match class {
            ContentClass::Document => &self.document,
            ContentClass::Image => &self.image,
            ContentClass::Video => &self.video,
            ContentClass::Archive => &self.archive,
            ContentClass::Other => &self.default,
        }
    }

    fn validate(&self) -> ReduceResult<()> {
        for profile in [&self.default, &self.document, &self.image, &self.video, &self.archive] {
            profile.validate()?;
        }
        Ok(())
    }
}

/// Chunking method selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkerConfig {
    /// Boundary every `size` bytes
    Fixed {
        /// Chunk size in bytes
        size: usize,
    },
    /// Content-defined TTTD chunking
    Tttd(TttdConfig),
    /// Sniff the content type, then TTTD with the matching profile
    Sniffing(SniffingConfig),
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig::Tttd(TttdConfig::default())
    }
}

impl ChunkerConfig {
    /// Validate the selected method's parameters
    pub fn validate(&self) -> ReduceResult<()> {
        match self {
            ChunkerConfig::Fixed { size } if *size == 0 => {
                Err(ReduceError::InvalidConfig("fixed chunk size must be non-zero".into()))
            }
            ChunkerConfig::Fixed { .. } => Ok(()),
            ChunkerConfig::Tttd(tttd) => tttd.validate(),
            ChunkerConfig::Sniffing(sniff) => sniff.validate(),
        }
    }
}

/// A validated chunker; cheap to clone, produces one [`ChunkStream`] per input
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    digest: DigestAlgorithm,
}

impl Chunker {
    /// Create a chunker, failing before any input is read if the configuration is unusable
    pub fn new(config: ChunkerConfig, digest: DigestAlgorithm) -> ReduceResult<Self> {
        config.validate()?;
        Ok(Self { config, digest })
    }

    /// Fixed-size chunker
    pub fn fixed(size: usize, digest: DigestAlgorithm) -> ReduceResult<Self> {
        Self::new(ChunkerConfig::Fixed { size }, digest)
    }

    /// TTTD chunker with the given parameters
    pub fn tttd(config: TttdConfig, digest: DigestAlgorithm) -> ReduceResult<Self> {
        Self::new(ChunkerConfig::Tttd(config), digest)
    }

    /// Digest algorithm used for chunk and file identity
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Active configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Start chunking a stream
    pub fn chunks<R: Read>(&self, reader: R) -> ChunkStream<R> {
        let (strategy, pending_sniff) = match &self.config {
            ChunkerConfig::Fixed { size } => (Strategy::Fixed(*size), None),
            ChunkerConfig::Tttd(tttd) => (Strategy::tttd(tttd.clone()), None),
            // replaced once the leading bytes have been sniffed
            ChunkerConfig::Sniffing(sniff) => {
                (Strategy::tttd(sniff.default.clone()), Some(sniff.clone()))
            }
        };
        ChunkStream {
            reader,
            digest: self.digest,
            strategy,
            pending_sniff,
            buf: Vec::new(),
            eof: false,
            offset: 0,
            file_hasher: Some(self.digest.hasher()),
            file_digest: None,
            content_class: None,
            exhausted: false,
        }
    }

    /// Chunk an in-memory buffer
    pub fn chunk_bytes(&self, data: &[u8]) -> ReduceResult<Vec<Chunk>> {
        self.chunks(data).collect()
    }
}

enum Strategy {
    Fixed(usize),
    Tttd {
        config: TttdConfig,
        fingerprinter: Fingerprinter,
    },
}

impl Strategy {
    fn tttd(config: TttdConfig) -> Self {
        let fingerprinter = config.fingerprint.build();
        Strategy::Tttd {
            config,
            fingerprinter,
        }
    }

    fn max_len(&self) -> usize {
        match self {
            Strategy::Fixed(size) => *size,
            Strategy::Tttd { config, .. } => config.max_size,
        }
    }

    fn cut(&mut self, buf: &[u8]) -> usize {
        match self {
            Strategy::Fixed(size) => (*size).min(buf.len()),
            Strategy::Tttd {
                config,
                fingerprinter,
            } => tttd_cut(buf, config, fingerprinter),
        }
    }
}

/// Find the TTTD boundary in `buf`, which holds at least `max_size` bytes unless the
/// input ended. Returns the chunk length.
fn tttd_cut(buf: &[u8], config: &TttdConfig, fp: &mut Fingerprinter) -> usize {
    let limit = buf.len().min(config.max_size);
    if limit <= config.min_size {
        return limit;
    }

    let first = config.min_size - 1;
    fp.reset();
    fp.check(buf, first + 1 - config.window_size, config.window_size);

    let mut backup = None;
    for i in first..limit {
        if i > first {
            fp.roll(buf[i]);
        }
        let value = fp.value();
        if value % config.main_divisor == 0 {
            return i + 1;
        }
        if value % config.backup_divisor == 0 {
            backup = Some(i + 1);
        }
    }

    if limit < config.max_size {
        // input ended before max_size: the remainder is the last chunk
        limit
    } else {
        backup.unwrap_or(limit)
    }
}

/// Lazy chunk sequence over one input stream
pub struct ChunkStream<R> {
    reader: R,
    digest: DigestAlgorithm,
    strategy: Strategy,
    pending_sniff: Option<SniffingConfig>,
    buf: Vec<u8>,
    eof: bool,
    offset: u64,
    file_hasher: Option<DigestHasher>,
    file_digest: Option<ChunkDigest>,
    content_class: Option<ContentClass>,
    exhausted: bool,
}

impl<R: Read> ChunkStream<R> {
    /// Whole-file digest; available once the stream is exhausted (also for empty input)
    pub fn file_digest(&self) -> Option<ChunkDigest> {
        self.file_digest
    }

    /// Content class chosen by a sniffing chunker, once sniffed
    pub fn content_class(&self) -> Option<ContentClass> {
        self.content_class
    }

    /// True once the terminal state has been reached
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn fill(&mut self, want: usize) -> io::Result<()> {
        while self.buf.len() < want && !self.eof {
            let start = self.buf.len();
            self.buf.resize(want, 0);
            match self.reader.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn finish_file_digest(&mut self) -> Option<ChunkDigest> {
        if let Some(hasher) = self.file_hasher.take() {
            self.file_digest = Some(hasher.finalize());
        }
        self.file_digest
    }

    fn produce(&mut self) -> ReduceResult<Option<Chunk>> {
        if let Some(profiles) = self.pending_sniff.take() {
            self.fill(SNIFF_LEN)?;
            let class = ContentClass::sniff(&self.buf);
            debug!(?class, "sniffed content class");
            self.content_class = Some(class);
            self.strategy = Strategy::tttd(profiles.profile(class).clone());
        }

        let want = self.strategy.max_len();
        self.fill(want)?;

        if self.buf.is_empty() {
            self.finish_file_digest();
            return Ok(None);
        }

        let cut = self.strategy.cut(&self.buf);
        let data: Vec<u8> = self.buf.drain(..cut).collect();
        if let Some(hasher) = self.file_hasher.as_mut() {
            hasher.update(&data);
        }

        // Look ahead one byte so the final chunk can carry the file digest.
        if self.buf.is_empty() {
            self.fill(1)?;
        }
        let file_digest = if self.buf.is_empty() && self.eof {
            self.finish_file_digest()
        } else {
            None
        };

        let chunk = Chunk {
            digest: self.digest.digest(&data),
            data: Bytes::from(data),
            offset: self.offset,
            file_digest,
        };
        self.offset += chunk.data.len() as u64;
        trace!(offset = chunk.offset, size = chunk.size(), digest = %chunk.digest.short(), "chunk emitted");
        Ok(Some(chunk))
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = ReduceResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.produce() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> FusedIterator for ChunkStream<R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn small_tttd() -> Chunker {
        Chunker::tttd(TttdConfig::with_average(1024), DigestAlgorithm::Blake3).unwrap()
    }

    fn concat(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    #[test]
    fn paper_parameters_scale_with_average() {
        let cfg = TttdConfig::with_average(1015);
        assert_eq!(cfg.min_size, 460);
        assert_eq!(cfg.max_size, 2800);
        assert_eq!(cfg.main_divisor, 540);
        assert_eq!(cfg.backup_divisor, 270);
        assert_eq!(cfg.window_size, DEFAULT_WINDOW_SIZE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected_up_front() {
        assert!(Chunker::fixed(0, DigestAlgorithm::Blake3).is_err());
        let mut cfg = TttdConfig::with_average(1024);
        cfg.backup_divisor = cfg.main_divisor;
        assert!(matches!(
            Chunker::tttd(cfg, DigestAlgorithm::Blake3),
            Err(ReduceError::InvalidConfig(_))
        ));
        let mut cfg = TttdConfig::with_average(1024);
        cfg.max_size = cfg.min_size;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fixed_chunks_have_fixed_size() {
        let data = pseudo_random(10_000, 7);
        let chunker = Chunker::fixed(4096, DigestAlgorithm::Sha256).unwrap();
        let chunks = chunker.chunk_bytes(&data).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Chunk::size).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(chunks[1].offset, 4096);
        assert_eq!(concat(&chunks), data);
    }

    #[test]
    fn last_chunk_carries_file_digest() {
        let data = pseudo_random(50_000, 3);
        let chunker = small_tttd();
        let chunks = chunker.chunk_bytes(&data).unwrap();
        let (last, rest) = chunks.split_last().unwrap();
        assert!(rest.iter().all(|c| c.file_digest.is_none()));
        assert_eq!(last.file_digest, Some(DigestAlgorithm::Blake3.digest(&data)));
    }

    #[test]
    fn chunk_digests_identify_content() {
        let data = pseudo_random(20_000, 11);
        for chunk in small_tttd().chunk_bytes(&data).unwrap() {
            assert_eq!(chunk.digest, DigestAlgorithm::Blake3.digest(&chunk.data));
        }
    }

    #[test]
    fn tttd_respects_size_bounds() {
        let cfg = TttdConfig::with_average(1024);
        let data = pseudo_random(200_000, 5);
        let chunks = Chunker::tttd(cfg.clone(), DigestAlgorithm::Blake3)
            .unwrap()
            .chunk_bytes(&data)
            .unwrap();
        let (_, body) = chunks.split_last().unwrap();
        for chunk in body {
            assert!(chunk.size() >= cfg.min_size, "chunk {} too small", chunk.size());
            assert!(chunk.size() <= cfg.max_size, "chunk {} too large", chunk.size());
        }
    }

    #[test]
    fn constant_input_falls_back_to_max_size() {
        let cfg = TttdConfig::with_average(1024);
        let data = vec![0x41u8; cfg.max_size * 3];
        let chunks = Chunker::tttd(cfg.clone(), DigestAlgorithm::Blake3)
            .unwrap()
            .chunk_bytes(&data)
            .unwrap();
        assert_eq!(concat(&chunks), data);
        assert!(chunks.iter().all(|c| c.size() <= cfg.max_size));
    }

    #[test]
    fn tttd_is_deterministic() {
        let data = pseudo_random(100_000, 9);
        let a: Vec<_> = small_tttd().chunk_bytes(&data).unwrap().into_iter().map(|c| c.digest).collect();
        let b: Vec<_> = small_tttd().chunk_bytes(&data).unwrap().into_iter().map(|c| c.digest).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn insertion_at_start_only_disturbs_leading_chunks() {
        let original = pseudo_random(200_000, 21);
        let mut modified = b"INSERT!".to_vec();
        modified.extend_from_slice(&original);

        let chunker = small_tttd();
        let a: Vec<_> = chunker.chunk_bytes(&original).unwrap().into_iter().map(|c| c.digest).collect();
        let b: Vec<_> = chunker.chunk_bytes(&modified).unwrap().into_iter().map(|c| c.digest).collect();
        assert!(b.len() > 2);
        assert!(a.ends_with(&b[2..]));
    }

    #[test]
    fn empty_input_yields_no_chunks_but_a_file_digest() {
        let chunker = small_tttd();
        let mut stream = chunker.chunks(&b""[..]);
        assert!(stream.next().is_none());
        assert!(stream.is_exhausted());
        assert_eq!(stream.file_digest(), Some(DigestAlgorithm::Blake3.digest(b"")));
    }

    #[test]
    fn exhausted_stream_stays_exhausted() {
        let data = pseudo_random(3000, 1);
        let chunker = small_tttd();
        let mut stream = chunker.chunks(&data[..]);
        while stream.next().is_some() {}
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    struct FailingReader {
        served: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served >= 5000 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            let n = buf.len().min(5000 - self.served);
            buf[..n].fill(0x5a);
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn read_error_is_surfaced_once_then_terminal() {
        let chunker = Chunker::fixed(4096, DigestAlgorithm::Blake3).unwrap();
        let mut stream = chunker.chunks(FailingReader { served: 0 });
        let mut saw_error = false;
        for item in stream.by_ref() {
            if let Err(ReduceError::Io(e)) = item {
                assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(stream.next().is_none());
        assert!(stream.file_digest().is_none());
    }

    #[test]
    fn sniffing_recognises_signatures() {
        assert_eq!(ContentClass::sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), ContentClass::Image);
        assert_eq!(ContentClass::sniff(b"%PDF-1.7"), ContentClass::Document);
        assert_eq!(ContentClass::sniff(b"PK\x03\x04\x0a\x00"), ContentClass::Archive);
        assert_eq!(
            ContentClass::sniff(&[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x06, 0x00, 0x08]),
            ContentClass::Document
        );
        let mut avi = b"RIFF\0\0\0\0AVI LIST".to_vec();
        avi.resize(64, 0);
        assert_eq!(ContentClass::sniff(&avi), ContentClass::Video);
        let mut odf = b"PK\x03\x04".to_vec();
        odf.resize(30, 0);
        odf.extend_from_slice(b"mimetypeapplication/vnd.oasis.opendocument.text");
        assert_eq!(ContentClass::sniff(&odf), ContentClass::Document);
        assert_eq!(ContentClass::sniff(b"plain text"), ContentClass::Other);
        assert_eq!(ContentClass::sniff(&[]), ContentClass::Other);
    }

    #[test]
    fn sniffing_chunker_uses_matching_profile() {
        let profiles = SniffingConfig {
            image: TttdConfig::with_average(4096),
            default: TttdConfig::with_average(512),
            ..SniffingConfig::default()
        };
        let chunker =
            Chunker::new(ChunkerConfig::Sniffing(profiles.clone()), DigestAlgorithm::Blake3).unwrap();

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.extend(pseudo_random(60_000, 4));
        let mut stream = chunker.chunks(&jpeg[..]);
        let chunks: Vec<Chunk> = stream.by_ref().collect::<ReduceResult<_>>().unwrap();
        assert_eq!(stream.content_class(), Some(ContentClass::Image));
        assert_eq!(concat(&chunks), jpeg);
        let (_, body) = chunks.split_last().unwrap();
        assert!(body.iter().all(|c| c.size() >= profiles.image.min_size));

        let text = pseudo_random(60_000, 4);
        let mut stream = chunker.chunks(&text[..]);
        let chunks: Vec<Chunk> = stream.by_ref().collect::<ReduceResult<_>>().unwrap();
        assert_eq!(stream.content_class(), Some(ContentClass::Other));
        assert_eq!(concat(&chunks), text);
    }

    #[test]
    fn chunker_config_toml_roundtrip() {
        let cfg = ChunkerConfig::Tttd(TttdConfig::with_average(8192));
        let text = toml::to_string(&cfg).unwrap();
        assert!(text.contains("type = \"tttd\""));
        let back: ChunkerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble_to_input(data in prop::collection::vec(any::<u8>(), 0..8000)) {
            let chunker = Chunker::tttd(TttdConfig::with_average(256), DigestAlgorithm::Blake3).unwrap();
            let chunks = chunker.chunk_bytes(&data).unwrap();
            prop_assert_eq!(concat(&chunks), data.clone());
            let mut offset = 0u64;
            for c in &chunks {
                prop_assert_eq!(c.offset, offset);
                prop_assert!(c.size() > 0);
                offset += c.size() as u64;
            }
        }
    }
}
