//! Causal merge of database versions from several replicas.
//!
//! Remote versions are partitioned against the local clock, ordered by a total order that
//! every replica computes identically, and folded per file history. A history's new head
//! is the single causally maximal version among the local head and the incoming versions;
//! when several are maximal the configured [`TieBreakPolicy`] picks one and the rest lose.
//!
//! The total order key is `(sum of clock coordinates, replica id, sequence)`. A causal
//! successor always has a larger clock sum, so the order extends causality and each
//! replica's own sequence order.

use crate::conflict::{
    conflict_copy_path, ConflictCandidate, ConflictKind, ConflictRecord, TieBreakPolicy,
};
use crate::database::Database;
use crate::error::{ReplError, ReplResult};
use crate::model::{
    DatabaseVersion, DatabaseVersionHeader, DatabaseVersionId, FileHistoryId, FileType,
    FileVersion,
};
use crate::vector_clock::{ClockOrdering, ReplicaId, VectorClock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info, instrument, warn};

/// New state of one history after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedHead {
    /// Local versions above this number are replaced.
    pub base: u64,
    /// Versions appended after `base`, in version order; the last one is the new head.
    pub updates: Vec<(FileVersion, DatabaseVersionHeader)>,
}

impl MergedHead {
    /// The winning version.
    pub fn head(&self) -> Option<&FileVersion> {
        self.updates.last().map(|(v, _)| v)
    }
}

/// A version that lost a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LosingVersion {
    /// The losing file version.
    pub version: FileVersion,
    /// Header of the database version carrying it.
    pub origin: DatabaseVersionHeader,
    /// True if it was this replica's current head.
    pub local: bool,
}

/// A history left untouched because its versions cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedHistory {
    /// History id.
    pub history: FileHistoryId,
    /// What was wrong.
    pub reason: String,
}

/// Output of [`DatabaseReconciler::reconcile`].
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Applicable remote versions in global total order.
    pub applied: Vec<DatabaseVersion>,
    /// Versions whose causal predecessors are neither applied nor in the batch.
    pub deferred: Vec<DatabaseVersionId>,
    /// Histories whose head changes.
    pub heads: BTreeMap<FileHistoryId, MergedHead>,
    /// Merged target tree: every visible head, path collisions resolved.
    pub tree: BTreeMap<FileHistoryId, FileVersion>,
    /// Versions that lost a conflict.
    pub losers: Vec<LosingVersion>,
    /// One record per resolved conflict.
    pub conflicts: Vec<ConflictRecord>,
    /// Histories that could not be merged.
    pub aborted: Vec<AbortedHistory>,
    /// Local clock merged with every applied version's clock.
    pub clock: VectorClock,
}

impl MergeResult {
    /// True if no remote version was applicable.
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Winning versions of the histories that changed, by history.
    pub fn winners(&self) -> impl Iterator<Item = (&FileHistoryId, &FileVersion)> {
        self.heads
            .iter()
            .filter_map(|(id, merged)| merged.head().map(|v| (id, v)))
    }

    /// Local heads that lost a conflict.
    pub fn local_losers(&self) -> Vec<FileVersion> {
        self.losers
            .iter()
            .filter(|l| l.local)
            .map(|l| l.version.clone())
            .collect()
    }
}

/// Deterministic global order of database versions.
pub fn total_order(a: &DatabaseVersionHeader, b: &DatabaseVersionHeader) -> Ordering {
    a.vector_clock
        .total()
        .cmp(&b.vector_clock.total())
        .then_with(|| a.replica.cmp(&b.replica))
        .then_with(|| a.sequence().cmp(&b.sequence()))
}

struct Event<'a> {
    version: &'a FileVersion,
    origin: &'a DatabaseVersionHeader,
    local: bool,
}

impl<'a> Event<'a> {
    fn clock(&self) -> &VectorClock {
        &self.origin.vector_clock
    }

    fn candidate(&self) -> ConflictCandidate<'a> {
        candidate(self.version, self.origin)
    }
}

fn candidate<'a>(version: &'a FileVersion, origin: &'a DatabaseVersionHeader) -> ConflictCandidate<'a> {
    ConflictCandidate {
        replica: &origin.replica,
        sequence: origin.sequence(),
        timestamp_ms: origin.timestamp_ms,
        version,
    }
}

fn precedes_or_equals(a: &VectorClock, b: &VectorClock) -> bool {
    matches!(a.compare(b), ClockOrdering::Smaller | ClockOrdering::Equal)
}

/// Merges remote database versions into a local database view.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseReconciler<'p> {
    policy: &'p dyn TieBreakPolicy,
}

impl<'p> DatabaseReconciler<'p> {
    /// Reconciler resolving conflicts with `policy`.
    pub fn new(policy: &'p dyn TieBreakPolicy) -> Self {
        Self { policy }
    }

    /// Merge `remote` into the state of `local`. Pure; `local` is not modified.
    #[instrument(skip(self, local, remote), fields(replica = %local.replica(), offered = remote.len()))]
    pub fn reconcile(&self, local: &Database, remote: Vec<DatabaseVersion>) -> MergeResult {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for version in remote {
            let id = version.id();
            if local.is_applied(&id) || !seen.insert(id.clone()) {
                debug!(version = %id, "skipping known version");
                continue;
            }
            match version.header().vector_clock.compare(local.clock()) {
                ClockOrdering::Greater | ClockOrdering::Simultaneous => candidates.push(version),
                ClockOrdering::Smaller | ClockOrdering::Equal => {
                    debug!(version = %id, "version covered by local clock");
                }
            }
        }
        candidates.sort_by(|a, b| total_order(a.header(), b.header()));

        let mut result = MergeResult {
            clock: local.clock().clone(),
            ..MergeResult::default()
        };
        let mut known = local.last_sequences().clone();
        for version in candidates {
            let header = version.header();
            if is_ready(header, &known) {
                known.insert(header.replica.clone(), header.sequence());
                result.clock = result.clock.merge(&header.vector_clock);
                result.applied.push(version);
            } else {
                warn!(version = %version.id(), "deferring version with missing predecessors");
                result.deferred.push(version.id());
            }
        }

        let mut touched: BTreeMap<FileHistoryId, Vec<Event<'_>>> = BTreeMap::new();
        for version in &result.applied {
            let mut latest: BTreeMap<FileHistoryId, &FileVersion> = BTreeMap::new();
            for fv in version.file_versions() {
                let slot = latest.entry(fv.history).or_insert(fv);
                if fv.version > slot.version {
                    *slot = fv;
                }
            }
            for (id, fv) in latest {
                touched.entry(id).or_default().push(Event {
                    version: fv,
                    origin: version.header(),
                    local: false,
                });
            }
        }

        for (id, mut events) in touched {
            if let Some((head, origin)) = local.head(&id) {
                events.push(Event {
                    version: head,
                    origin,
                    local: true,
                });
            }
            if let Err(e) = check_history(id, &events) {
                error!(error = %e, "aborting history");
                result.aborted.push(AbortedHistory {
                    history: id,
                    reason: e.to_string(),
                });
                continue;
            }

            let mut maximal: Vec<&Event<'_>> = events
                .iter()
                .filter(|e| {
                    !events
                        .iter()
                        .any(|f| f.clock().compare(e.clock()) == ClockOrdering::Greater)
                })
                .collect();
            maximal.sort_by(|a, b| self.policy.compare(&a.candidate(), &b.candidate()));
            let Some((winner, losers)) = maximal.split_first() else {
                continue;
            };

            for loser in losers {
                let record = ConflictRecord::new(id, &winner.candidate(), &loser.candidate());
                warn!(
                    history = %id,
                    winner = %winner.origin.id(),
                    loser = %loser.origin.id(),
                    policy = self.policy.name(),
                    kind = ?record.kind,
                    "resolved concurrent edit"
                );
                result.losers.push(LosingVersion {
                    version: loser.version.clone(),
                    origin: loser.origin.clone(),
                    local: loser.local,
                });
                result.conflicts.push(record);
            }
            if winner.local {
                continue;
            }

            let base = local
                .history(&id)
                .and_then(|h| {
                    h.versions().iter().rev().find(|v| {
                        local
                            .origin(&id, v.version)
                            .is_some_and(|o| precedes_or_equals(&o.vector_clock, winner.clock()))
                    })
                })
                .map(|v| v.version)
                .unwrap_or(0);
            let mut updates: Vec<(FileVersion, DatabaseVersionHeader)> = events
                .iter()
                .filter(|e| !e.local && e.version.version > base)
                .filter(|e| precedes_or_equals(e.clock(), winner.clock()))
                .map(|e| (e.version.clone(), e.origin.clone()))
                .collect();
            updates.sort_by_key(|(v, _)| v.version);
            debug!(history = %id, base, updates = updates.len(), "history advanced");
            result.heads.insert(id, MergedHead { base, updates });
        }

        let mut heads: Vec<(FileVersion, DatabaseVersionHeader)> = local
            .heads()
            .filter(|(v, _)| !result.heads.contains_key(&v.history))
            .map(|(v, o)| (v.clone(), o.clone()))
            .collect();
        heads.extend(
            result
                .heads
                .values()
                .filter_map(|merged| merged.updates.last().cloned()),
        );
        let (tree, collisions) = self.resolve_paths(heads);
        result.tree = tree;
        result.conflicts.extend(collisions);

        info!(
            applied = result.applied.len(),
            deferred = result.deferred.len(),
            histories = result.heads.len(),
            conflicts = result.conflicts.len(),
            aborted = result.aborted.len(),
            clock = %result.clock,
            "reconciled database versions"
        );
        result
    }

    /// Visible tree of `db` with path collisions resolved the same way a merge resolves them.
    pub fn target_tree(&self, db: &Database) -> BTreeMap<FileHistoryId, FileVersion> {
        let heads = db.heads().map(|(v, o)| (v.clone(), o.clone())).collect();
        self.resolve_paths(heads).0
    }

    /// Give every visible head a distinct path. Folders share a path with each other;
    /// a file or symlink colliding with anything else, or sitting where a folder's child
    /// needs a parent directory, moves to a conflict copy name.
    fn resolve_paths(
        &self,
        heads: Vec<(FileVersion, DatabaseVersionHeader)>,
    ) -> (BTreeMap<FileHistoryId, FileVersion>, Vec<ConflictRecord>) {
        let mut by_path: BTreeMap<String, Vec<(FileVersion, DatabaseVersionHeader)>> = BTreeMap::new();
        for (version, origin) in heads {
            if !version.is_deleted() {
                by_path.entry(version.path.clone()).or_default().push((version, origin));
            }
        }

        let parents: HashSet<String> = by_path
            .keys()
            .flat_map(|path| ancestors(path).map(str::to_string))
            .collect();
        let mut taken: HashSet<String> = by_path.keys().cloned().collect();
        let mut tree = BTreeMap::new();
        let mut records = Vec::new();

        for (path, mut group) in by_path {
            let has_folder = group.iter().any(|(v, _)| v.file_type == FileType::Folder);
            group.sort_by(|a, b| {
                let folder_first = (b.0.file_type == FileType::Folder).cmp(&(a.0.file_type == FileType::Folder));
                folder_first.then_with(|| self.policy.compare(&candidate(&a.0, &a.1), &candidate(&b.0, &b.1)))
            });
            let keep = if has_folder || parents.contains(&path) {
                group.iter().filter(|(v, _)| v.file_type == FileType::Folder).count()
            } else {
                1
            };

            let at = keep.min(group.len());
            let (kept, moved) = group.split_at_mut(at);
            for (version, origin) in moved.iter_mut() {
                let winner = kept.first().map(|(v, o)| candidate(v, o));
                let mut record = match winner {
                    Some(w) => ConflictRecord::new(version.history, &w, &candidate(version, origin)),
                    None => ConflictRecord::new(
                        version.history,
                        &candidate(version, origin),
                        &candidate(version, origin),
                    ),
                };
                record.kind = ConflictKind::PathCollision;
                let renamed = conflict_copy_path(&path, &origin.replica, version.version, |p| {
                    taken.contains(p)
                });
                warn!(history = %version.history, %path, %renamed, "path collision, showing conflict copy");
                taken.insert(renamed.clone());
                version.path = renamed;
                records.push(record);
            }
            for (version, _) in group {
                tree.insert(version.history, version);
            }
        }
        (tree, records)
    }
}

/// Proper ancestors of a `/`-separated path, nearest first.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.rmatch_indices('/').map(move |(i, _)| &path[..i])
}

fn is_ready(header: &DatabaseVersionHeader, known: &BTreeMap<ReplicaId, u64>) -> bool {
    let seen = |r: &ReplicaId| known.get(r).copied().unwrap_or(0);
    header.sequence() == seen(&header.replica) + 1
        && header
            .vector_clock
            .iter()
            .filter(|(r, _)| **r != header.replica)
            .all(|(r, n)| seen(r) >= n)
}

fn check_history(id: FileHistoryId, events: &[Event<'_>]) -> ReplResult<()> {
    let unreconcilable = |reason: String| ReplError::UnreconcilableHistory {
        history: id.to_string(),
        reason,
    };
    for (i, a) in events.iter().enumerate() {
        for b in &events[i + 1..] {
            let (earlier, later) = match a.clock().compare(b.clock()) {
                ClockOrdering::Smaller => (a, b),
                ClockOrdering::Greater => (b, a),
                ClockOrdering::Simultaneous => {
                    if a.version.version == 1 || b.version.version == 1 {
                        return Err(unreconcilable(format!(
                            "created independently by {} and {}",
                            a.origin.id(),
                            b.origin.id()
                        )));
                    }
                    continue;
                }
                ClockOrdering::Equal => continue,
            };
            if later.version.version <= earlier.version.version {
                return Err(unreconcilable(format!(
                    "version {} from {} does not follow version {} from {}",
                    later.version.version,
                    later.origin.id(),
                    earlier.version.version,
                    earlier.origin.id()
                )));
            }
        }
    }
    Ok(())
}
