//! Per-replica sync configuration, loadable from TOML or JSON.

use crate::conflict::ConflictPolicyKind;
use crate::error::{ReplError, ReplResult};
use crate::local_tree::is_safe_path;
use crate::vector_clock::ReplicaId;
use meshsync_reduce::DedupConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_state_dir() -> String {
    ".meshsync".to_string()
}

/// Everything one replica needs to sync a local root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// This replica's id.
    pub replica: ReplicaId,
    /// Local sync root.
    pub root: PathBuf,
    /// Top-level directory under `root` holding scratch data; never synced.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// How concurrent versions are ordered.
    #[serde(default)]
    pub conflict_policy: ConflictPolicyKind,
    /// Chunking, packing and transforms.
    #[serde(default)]
    pub dedup: DedupConfig,
}

impl SyncConfig {
    /// Defaults for everything but the replica and the root.
    pub fn new(replica: ReplicaId, root: impl Into<PathBuf>) -> Self {
        Self {
            replica,
            root: root.into(),
            state_dir: default_state_dir(),
            conflict_policy: ConflictPolicyKind::default(),
            dedup: DedupConfig::default(),
        }
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> ReplResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ReplError::InvalidConfig("root must not be empty".into()));
        }
        if self.state_dir.contains('/') || !is_safe_path(&self.state_dir, "") {
            return Err(ReplError::InvalidConfig(format!(
                "state_dir must be a single path component, got {:?}",
                self.state_dir
            )));
        }
        self.dedup.validate()?;
        Ok(())
    }

    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Absolute path of the state directory.
    pub fn state_path(&self) -> PathBuf {
        self.root.join(&self.state_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn replica() -> ReplicaId {
        ReplicaId::new("laptop").unwrap()
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::new(replica(), "/srv/sync");
        assert_eq!(config.state_dir, ".meshsync");
        assert_eq!(config.conflict_policy, ConflictPolicyKind::EarliestTimestamp);
        assert_eq!(config.state_path(), PathBuf::from("/srv/sync/.meshsync"));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_state_dir() {
        for bad in ["", "a/b", "..", "."] {
            let mut config = SyncConfig::new(replica(), "/srv/sync");
            config.state_dir = bad.to_string();
            assert!(config.validate().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn loads_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
replica = "desktop"
root = "/home/me/sync"

[conflict_policy]
type = "replica_priority"
order = ["desktop", "laptop"]

[dedup.limits]
max_files = 500
"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.replica.as_str(), "desktop");
        assert_eq!(config.state_dir, ".meshsync");
        assert_eq!(
            config.conflict_policy,
            ConflictPolicyKind::ReplicaPriority {
                order: vec![ReplicaId::new("desktop").unwrap(), replica()]
            }
        );
        assert_eq!(config.dedup.limits.max_files, Some(500));
    }

    #[test]
    fn loads_json_and_rejects_unknown_extension() {
        let mut json = NamedTempFile::with_suffix(".json").unwrap();
        write!(json, r#"{{"replica": "phone", "root": "/data", "state_dir": ".sync"}}"#).unwrap();
        let config = SyncConfig::from_file(json.path()).unwrap();
        assert_eq!(config.state_dir, ".sync");

        let yaml = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(SyncConfig::from_file(yaml.path()).is_err());
    }

    #[test]
    fn invalid_replica_fails_to_load() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "replica = \"node1\"\nroot = \"/x\"").unwrap();
        assert!(SyncConfig::from_file(file.path()).is_err());
    }
}
