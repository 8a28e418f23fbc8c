//! LZ4 and Zstd compression of sealed multichunk payloads

use crate::error::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};

/// Compression applied to a whole container payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Store as-is
    None,
    /// LZ4 block format with the uncompressed size prepended
    #[default]
    Lz4,
    /// Zstandard, better ratio for cold containers
    Zstd {
        /// Compression level (1 fastest, 19 best ratio)
        level: i32,
    },
}

impl CompressionAlgorithm {
    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd { .. } => "zstd",
        }
    }

    /// Parse a configuration name; zstd uses level 3
    pub fn from_name(name: &str) -> ReduceResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionAlgorithm::None),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd { level: 3 }),
            _ => Err(ReduceError::UnsupportedAlgorithm {
                kind: "compression",
                name: name.to_string(),
            }),
        }
    }
}

/// Compress data with the given algorithm
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> ReduceResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
    }
}

/// Reverse [`compress`]
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> ReduceResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd { level: 3 },
    ];

    proptest! {
        #[test]
        fn prop_roundtrip(data in prop::collection::vec(any::<u8>(), 0..50_000)) {
            for algo in ALL {
                let c = compress(&data, algo).unwrap();
                prop_assert_eq!(decompress(&c, algo).unwrap(), data.clone());
            }
        }
    }

    #[test]
    fn repetitive_payload_shrinks() {
        let data = b"multichunk ".repeat(4096);
        for algo in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd { level: 3 }] {
            assert!(compress(&data, algo).unwrap().len() < data.len() / 4);
        }
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let err = decompress(&[0xff; 16], CompressionAlgorithm::Zstd { level: 3 }).unwrap_err();
        assert!(matches!(err, ReduceError::DecompressionFailed(_)));
    }

    #[test]
    fn names_parse() {
        assert_eq!(CompressionAlgorithm::from_name("LZ4").unwrap(), CompressionAlgorithm::Lz4);
        assert_eq!(
            CompressionAlgorithm::from_name("zstd").unwrap().name(),
            "zstd"
        );
        assert!(CompressionAlgorithm::from_name("brotli").is_err());
    }
}
