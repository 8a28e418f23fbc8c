//! Deduplication configuration, loadable from TOML or JSON

use crate::chunker::ChunkerConfig;
use crate::deduper::TransactionLimits;
use crate::digest::DigestAlgorithm;
use crate::error::{ReduceError, ReduceResult};
use crate::multichunk::MultiChunkConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the dedup engine needs to know before reading a byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DedupConfig {
    /// Chunk and file digest
    pub digest: DigestAlgorithm,
    /// Chunking method and its parameters
    pub chunker: ChunkerConfig,
    /// Container capacity and transforms
    pub multichunk: MultiChunkConfig,
    /// Per-run limits
    pub limits: TransactionLimits,
}

impl DedupConfig {
    /// Reject inconsistent values
    pub fn validate(&self) -> ReduceResult<()> {
        self.chunker.validate()?;
        self.multichunk.validate()?;
        if self.limits.max_files == Some(0) || self.limits.max_total_size == Some(0) {
            return Err(ReduceError::InvalidConfig(
                "transaction limits must be non-zero when set".into(),
            ));
        }
        Ok(())
    }

    /// Load from a `.toml` or `.json` file and validate
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DedupConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }
}
