//! Tie-break policies for concurrent (SIMULTANEOUS) edits of one file history.
//!
//! A policy only orders candidates; it sees nothing but the candidates themselves, so every
//! replica holding the same versions picks the same winner.

use crate::model::{FileHistoryId, FileVersion};
use crate::vector_clock::ReplicaId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// One contender in a conflict.
#[derive(Debug, Clone, Copy)]
pub struct ConflictCandidate<'a> {
    /// Replica that authored the database version carrying this file version.
    pub replica: &'a ReplicaId,
    /// Sequence of that database version.
    pub sequence: u64,
    /// Authoring wall-clock time of that database version, ms.
    pub timestamp_ms: u64,
    /// The contending file version.
    pub version: &'a FileVersion,
}

/// Orders conflict candidates; the minimum wins.
pub trait TieBreakPolicy: fmt::Debug + Send + Sync {
    /// `Less` if `a` should win over `b`. Must be a total order.
    fn compare(&self, a: &ConflictCandidate<'_>, b: &ConflictCandidate<'_>) -> Ordering;

    /// Name used in logs and conflict records.
    fn name(&self) -> &'static str;
}

/// Earlier authoring timestamp wins, then the smaller replica id, then the lower sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct EarliestTimestamp;

impl TieBreakPolicy for EarliestTimestamp {
    fn compare(&self, a: &ConflictCandidate<'_>, b: &ConflictCandidate<'_>) -> Ordering {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.replica.cmp(b.replica))
            .then_with(|| a.sequence.cmp(&b.sequence))
    }

    fn name(&self) -> &'static str {
        "earliest-timestamp"
    }
}

/// Replicas listed earlier win; unlisted replicas rank last, by replica id.
#[derive(Debug, Clone, Default)]
pub struct ReplicaPriority {
    order: Vec<ReplicaId>,
}

impl ReplicaPriority {
    /// Highest priority first.
    pub fn new(order: Vec<ReplicaId>) -> Self {
        Self { order }
    }

    fn rank(&self, replica: &ReplicaId) -> usize {
        self.order
            .iter()
            .position(|r| r == replica)
            .unwrap_or(self.order.len())
    }
}

impl TieBreakPolicy for ReplicaPriority {
    fn compare(&self, a: &ConflictCandidate<'_>, b: &ConflictCandidate<'_>) -> Ordering {
        self.rank(a.replica)
            .cmp(&self.rank(b.replica))
            .then_with(|| a.replica.cmp(b.replica))
            .then_with(|| a.sequence.cmp(&b.sequence))
    }

    fn name(&self) -> &'static str {
        "replica-priority"
    }
}

/// Policy selection in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictPolicyKind {
    /// [`EarliestTimestamp`]
    #[default]
    EarliestTimestamp,
    /// [`ReplicaPriority`]
    ReplicaPriority {
        /// Highest priority first.
        order: Vec<ReplicaId>,
    },
}

impl ConflictPolicyKind {
    /// Instantiate the policy.
    pub fn build(&self) -> Box<dyn TieBreakPolicy> {
        match self {
            ConflictPolicyKind::EarliestTimestamp => Box::new(EarliestTimestamp),
            ConflictPolicyKind::ReplicaPriority { order } => {
                Box::new(ReplicaPriority::new(order.clone()))
            }
        }
    }
}

/// Why a version lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Concurrent edits; the policy picked the winner.
    PolicyResolved,
    /// Concurrent edits with identical content; nothing visible is lost.
    IdenticalContent,
    /// Different histories claim one path; the loser is shown under a conflict copy name.
    PathCollision,
}

/// Name a conflict copy: `docs/report.txt` becomes
/// `docs/report (conflicted copy, laptop, 3).txt`.
///
/// `taken` reports occupied paths; a counter is appended until a free name is found.
pub fn conflict_copy_path(
    path: &str,
    replica: &ReplicaId,
    version: u64,
    taken: impl Fn(&str) -> bool,
) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    let mut attempt = 1u32;
    loop {
        let label = if attempt == 1 {
            format!("{stem} (conflicted copy, {replica}, {version}){ext}")
        } else {
            format!("{stem} (conflicted copy, {replica}, {version}, {attempt}){ext}")
        };
        let candidate = match dir {
            Some(dir) => format!("{dir}/{label}"),
            None => label,
        };
        if !taken(&candidate) {
            return candidate;
        }
        attempt += 1;
    }
}

/// Record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// History that had the conflict.
    pub history: FileHistoryId,
    /// Winning replica.
    pub winner: ReplicaId,
    /// Winning file version number.
    pub winner_version: u64,
    /// Losing replica.
    pub loser: ReplicaId,
    /// Losing file version number.
    pub loser_version: u64,
    /// Resolution kind.
    pub kind: ConflictKind,
}

impl ConflictRecord {
    /// Build a record for `winner` beating `loser`.
    pub fn new(history: FileHistoryId, winner: &ConflictCandidate<'_>, loser: &ConflictCandidate<'_>) -> Self {
        let kind = if winner.version.same_content(loser.version) && winner.version.path == loser.version.path {
            ConflictKind::IdenticalContent
        } else {
            ConflictKind::PolicyResolved
        };
        Self {
            history,
            winner: winner.replica.clone(),
            winner_version: winner.version.version,
            loser: loser.replica.clone(),
            loser_version: loser.version.version,
            kind,
        }
    }
}
