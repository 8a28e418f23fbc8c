//! Sync driver: one replica's context and its `up`/`down` passes.
//!
//! `up` indexes local changes, uploads new containers and then the version document.
//! `down` fetches unknown remote versions, reconciles them, brings the local tree to the
//! merged state and records the merge only if every action succeeded, so an interrupted
//! or partly failed pass is simply repeated. Until that repeat commits, `up` publishes
//! nothing: the tree holds remote entries the database does not know yet.

use crate::actions::FileSystemActionReconciler;
use crate::config::SyncConfig;
use crate::conflict::{ConflictRecord, TieBreakPolicy};
use crate::database::Database;
use crate::error::ReplResult;
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::indexer::Indexer;
use crate::local_tree::LocalTree;
use crate::model::DatabaseVersionId;
use crate::reconciler::{AbortedHistory, DatabaseReconciler};
use crate::transfer::{ContentFetcher, MetadataExchange, RemoteUpload, MULTICHUNKS_DIR};
use bytes::Bytes;
use meshsync_reduce::{Deduper, DirectoryContainerStore, EncryptionKey};
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{info, instrument, warn};

/// What an `up` pass published.
#[derive(Debug, Default)]
pub struct UpReport {
    /// The published version, if there were local changes.
    pub version: Option<DatabaseVersionId>,
    /// File versions it carries.
    pub files: usize,
    /// Containers uploaded.
    pub containers: usize,
    /// Paths left for the next pass.
    pub deferred: Vec<String>,
    /// True if a partly applied merge kept the pass from indexing.
    pub blocked: bool,
}

/// What a `down` pass did.
#[derive(Debug, Default)]
pub struct DownReport {
    /// Remote versions merged.
    pub applied: Vec<DatabaseVersionId>,
    /// Remote versions waiting for missing predecessors.
    pub deferred: Vec<DatabaseVersionId>,
    /// One outcome per planned action.
    pub outcomes: Vec<ActionOutcome>,
    /// Conflicts resolved by the merge.
    pub conflicts: Vec<ConflictRecord>,
    /// Histories left untouched.
    pub aborted: Vec<AbortedHistory>,
    /// True if the merge was recorded in the local database.
    pub committed: bool,
}

/// One replica: configuration, local database and remote.
pub struct SyncContext<R> {
    config: SyncConfig,
    db: Database,
    deduper: Deduper,
    policy: Box<dyn TieBreakPolicy>,
    remote: R,
    merge_pending: bool,
}

impl<R> SyncContext<R>
where
    R: MetadataExchange + ContentFetcher + RemoteUpload,
{
    /// Validate `config` and start with an empty local database.
    pub fn new(config: SyncConfig, master_key: Option<EncryptionKey>, remote: R) -> ReplResult<Self> {
        config.validate()?;
        let deduper = Deduper::from_config(&config.dedup, master_key)?;
        let policy = config.conflict_policy.build();
        let db = Database::new(config.replica.clone());
        info!(
            replica = %config.replica,
            root = %config.root.display(),
            policy = policy.name(),
            "sync context created"
        );
        Ok(Self {
            config,
            db,
            deduper,
            policy,
            remote,
            merge_pending: false,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Remote in use.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// True after a `down` pass changed the tree without recording its merge.
    pub fn merge_pending(&self) -> bool {
        self.merge_pending
    }

    /// Index local changes and publish them: containers first, then the version.
    #[instrument(skip(self), fields(replica = %self.config.replica))]
    pub async fn up(&mut self) -> ReplResult<UpReport> {
        if self.merge_pending {
            warn!("last down pass was not recorded; run down before publishing");
            return Ok(UpReport {
                blocked: true,
                ..UpReport::default()
            });
        }
        let root = &self.config.root;
        let state_dir = self.config.state_dir.as_str();
        let staging = self.config.state_path().join(MULTICHUNKS_DIR);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut store = DirectoryContainerStore::new(staging.clone())?;

        let digest = self.config.dedup.digest;
        let disk = LocalTree::scan(root, digest, state_dir)?;
        let tree = DatabaseReconciler::new(self.policy.as_ref()).target_tree(&self.db);
        let outcome = Indexer::new(root, state_dir, &self.db, &self.deduper).index(
            &tree,
            &disk,
            &mut store,
            now_ms(),
        )?;

        let mut report = UpReport {
            deferred: outcome.deferred,
            ..UpReport::default()
        };
        let Some(version) = outcome.version else {
            return Ok(report);
        };

        for sealed in &outcome.sealed {
            let data = store.read(&sealed.id)?;
            self.remote.upload_multichunk(&sealed.id, Bytes::from(data)).await?;
            fs::remove_file(store.path_for(&sealed.id)).await?;
        }
        self.remote.upload_database_version(&version).await?;
        self.db.apply_local(&version)?;

        report.version = Some(version.id());
        report.files = version.file_versions().len();
        report.containers = outcome.sealed.len();
        info!(
            version = %version.id(),
            files = report.files,
            containers = report.containers,
            deferred = report.deferred.len(),
            "published local changes"
        );
        Ok(report)
    }

    /// Merge unknown remote versions into the local tree and database.
    #[instrument(skip(self), fields(replica = %self.config.replica))]
    pub async fn down(&mut self) -> ReplResult<DownReport> {
        let mut fetched = Vec::new();
        for id in self.remote.list_remote_database_versions().await? {
            if !self.db.is_applied(&id) {
                fetched.push(self.remote.fetch_database_version(&id).await?);
            }
        }

        let reconciler = DatabaseReconciler::new(self.policy.as_ref());
        let merge = reconciler.reconcile(&self.db, fetched);
        let mut report = DownReport {
            deferred: merge.deferred.clone(),
            conflicts: merge.conflicts.clone(),
            aborted: merge.aborted.clone(),
            ..DownReport::default()
        };
        if merge.is_empty() {
            self.merge_pending = false;
            report.committed = true;
            return Ok(report);
        }

        let root = &self.config.root;
        let state_dir = self.config.state_dir.as_str();
        let previous = reconciler.target_tree(&self.db);
        let disk = LocalTree::scan(root, self.config.dedup.digest, state_dir)?;
        let actions = FileSystemActionReconciler::new(&self.config.replica, state_dir).plan(
            &previous,
            &disk,
            &merge.tree,
            &merge.local_losers(),
        );

        let mut staged = self.db.clone();
        staged.apply_merge(&merge)?;
        report.outcomes = ActionExecutor::new(
            root,
            state_dir,
            &staged,
            self.deduper.multichunker(),
            &self.remote,
            self.config.dedup.digest,
        )
        .execute(actions)
        .await?;
        report.applied = merge.applied.iter().map(|v| v.id()).collect();

        let failed = report.outcomes.iter().filter(|o| o.is_failed()).count();
        if failed == 0 {
            self.db = staged;
            self.merge_pending = false;
            report.committed = true;
            info!(
                versions = report.applied.len(),
                actions = report.outcomes.len(),
                conflicts = report.conflicts.len(),
                "merged remote changes"
            );
        } else {
            self.merge_pending = true;
            warn!(failed, "actions failed, merge not recorded; it will be retried");
        }
        Ok(report)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
