//! Plans the file system actions that turn the local tree into a merged target tree.
//!
//! Planning diffs the target against what is actually on disk, so planning again after a
//! partially applied run yields only the remaining work.
//!
//! Execution order:
//! 1. relocations of untracked or losing local entries to conflict copy names
//! 2. file and symlink deletions
//! 3. folder creations, parents first
//! 4. renames of tracked files and symlinks, chains ordered and cycles broken through a
//!    staging path
//! 5. folder creations at or below a path that a rename in step 4 vacates
//! 6. file and symlink writes
//! 7. attribute updates
//! 8. folder deletions, children first
//! 9. writes and renames into the path of a folder deleted in step 8

use crate::conflict::conflict_copy_path;
use crate::local_tree::{is_safe_path, LocalTree};
use crate::model::{FileHistoryId, FileType, FileVersion};
use crate::vector_clock::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Directory under the state directory used to break rename cycles.
pub const STAGING_DIR: &str = "staging";

/// What an action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Create an entry that has no local predecessor at this path.
    New,
    /// Rewrite an entry in place.
    Changed,
    /// Move an entry.
    Renamed,
    /// Remove an entry.
    Deleted,
    /// Update permission bits only.
    SetAttributes,
}

/// One planned file system operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemAction {
    /// Operation.
    pub kind: ActionKind,
    /// History the action materializes; `None` for relocations of local entries.
    pub history: Option<FileHistoryId>,
    /// Entry kind.
    pub file_type: FileType,
    /// Destination path (the removed path for deletions).
    pub path: String,
    /// Source path of a rename.
    pub from: Option<String>,
    /// Version to materialize; for deletions, the version expected on disk.
    pub target: Option<FileVersion>,
}

impl FileSystemAction {
    fn new(kind: ActionKind, target: &FileVersion) -> Self {
        Self {
            kind,
            history: Some(target.history),
            file_type: target.file_type,
            path: target.path.clone(),
            from: None,
            target: Some(target.clone()),
        }
    }

    fn rename(from: &str, target: &FileVersion) -> Self {
        Self {
            from: Some(from.to_string()),
            ..Self::new(ActionKind::Renamed, target)
        }
    }

    fn delete(previous: &FileVersion) -> Self {
        Self::new(ActionKind::Deleted, previous)
    }

    fn relocate(from: &str, to: String, file_type: FileType) -> Self {
        Self {
            kind: ActionKind::Renamed,
            history: None,
            file_type,
            path: to,
            from: Some(from.to_string()),
            target: None,
        }
    }

    /// True for a move of a local entry out of the way.
    pub fn is_relocation(&self) -> bool {
        self.kind == ActionKind::Renamed && self.history.is_none()
    }
}

impl fmt::Display for FileSystemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(f, "{:?} {} -> {}", self.kind, from, self.path),
            None => write!(f, "{:?} {}", self.kind, self.path),
        }
    }
}

/// Turns a merged target tree into an ordered action list.
#[derive(Debug, Clone)]
pub struct FileSystemActionReconciler<'a> {
    local: &'a ReplicaId,
    state_dir: &'a str,
}

#[derive(Default)]
struct Plan {
    relocations: Vec<FileSystemAction>,
    deletes: Vec<FileSystemAction>,
    folders: Vec<FileSystemAction>,
    renames: Vec<FileSystemAction>,
    writes: Vec<FileSystemAction>,
    attributes: Vec<FileSystemAction>,
    folder_deletes: Vec<FileSystemAction>,
}

impl<'a> FileSystemActionReconciler<'a> {
    /// Planner for replica `local`, whose state lives in the top-level `state_dir`.
    pub fn new(local: &'a ReplicaId, state_dir: &'a str) -> Self {
        Self { local, state_dir }
    }

    /// Plan the transition from `previous` (the local tree the database last recorded)
    /// to `target`, given what `disk` holds now. `local_losers` are local heads that lost
    /// a conflict; their on-disk content is preserved as conflict copies.
    #[instrument(skip_all, fields(previous = previous.len(), target = target.len()))]
    pub fn plan(
        &self,
        previous: &BTreeMap<FileHistoryId, FileVersion>,
        disk: &LocalTree,
        target: &BTreeMap<FileHistoryId, FileVersion>,
        local_losers: &[FileVersion],
    ) -> Vec<FileSystemAction> {
        let mut plan = Plan::default();
        let mut targets: Vec<&FileVersion> = target
            .values()
            .filter(|t| {
                let safe = is_safe_path(&t.path, self.state_dir);
                if !safe {
                    warn!(history = %t.history, path = %t.path, "refusing unsafe target path");
                }
                safe
            })
            .collect();
        targets.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.history.cmp(&b.history)));

        let mut target_at: HashMap<&str, &FileVersion> = HashMap::new();
        for &t in &targets {
            target_at.entry(t.path.as_str()).or_insert(t);
        }
        let previous_at: HashMap<&str, &FileVersion> =
            previous.values().map(|v| (v.path.as_str(), v)).collect();

        let mut taken: HashSet<String> = disk
            .iter()
            .map(|(p, _)| p.clone())
            .chain(targets.iter().map(|t| t.path.clone()))
            .collect();
        let mut relocated: HashSet<String> = HashSet::new();
        let mut sources: HashSet<String> = HashSet::new();

        for loser in local_losers {
            if loser.is_deleted() || loser.file_type == FileType::Folder {
                continue;
            }
            let Some(entry) = disk.get(&loser.path) else {
                continue;
            };
            if !entry.matches(loser) {
                continue;
            }
            let winner = target.get(&loser.history);
            if winner.is_some_and(|w| w.path == loser.path && w.same_content(loser)) {
                continue;
            }
            let to = conflict_copy_path(&loser.path, self.local, loser.version, |p| taken.contains(p));
            info!(path = %loser.path, copy = %to, "keeping losing local version as conflict copy");
            taken.insert(to.clone());
            relocated.insert(loser.path.clone());
            plan.relocations
                .push(FileSystemAction::relocate(&loser.path, to, entry.file_type));
        }

        for t in &targets {
            let occupant = disk.get(&t.path).filter(|_| !relocated.contains(&t.path));
            if let Some(entry) = occupant {
                if entry.matches(t) {
                    if !entry.attributes_match(t) {
                        plan.attributes
                            .push(FileSystemAction::new(ActionKind::SetAttributes, t));
                    }
                    continue;
                }
                let tracked = previous_at
                    .get(t.path.as_str())
                    .filter(|p| entry.matches(p));
                if tracked.is_none() {
                    let version = previous_at.get(t.path.as_str()).map_or(0, |p| p.version);
                    let to = conflict_copy_path(&t.path, self.local, version, |p| taken.contains(p));
                    info!(path = %t.path, copy = %to, "moving untracked or modified entry aside");
                    taken.insert(to.clone());
                    relocated.insert(t.path.clone());
                    plan.relocations
                        .push(FileSystemAction::relocate(&t.path, to, entry.file_type));
                }
            }

            if t.file_type == FileType::Folder {
                plan.folders.push(FileSystemAction::new(ActionKind::New, t));
                continue;
            }

            let before = previous.get(&t.history);
            if let Some(p) = before.filter(|p| p.path != t.path && p.file_type == t.file_type) {
                let source_matches = !relocated.contains(&p.path)
                    && disk.get(&p.path).is_some_and(|e| e.matches(t));
                let source_claimed = target_at.get(p.path.as_str()).is_some_and(|o| {
                    o.history != t.history && disk.get(&p.path).is_some_and(|e| e.matches(o))
                });
                if source_matches && !source_claimed {
                    sources.insert(p.path.clone());
                    plan.renames.push(FileSystemAction::rename(&p.path, t));
                    continue;
                }
            }
            let kind = match before {
                Some(p) if p.path == t.path && p.file_type == t.file_type => ActionKind::Changed,
                _ => ActionKind::New,
            };
            plan.writes.push(FileSystemAction::new(kind, t));
        }

        for p in previous.values() {
            let stays = target
                .get(&p.history)
                .is_some_and(|t| t.path == p.path && t.file_type == p.file_type);
            if stays || sources.contains(&p.path) || relocated.contains(&p.path) {
                continue;
            }
            let Some(entry) = disk.get(&p.path) else {
                continue;
            };
            if !entry.matches(p) {
                debug!(path = %p.path, "leaving locally modified entry in place");
                continue;
            }
            if let Some(o) = target_at.get(p.path.as_str()) {
                let overwritten = o.file_type == entry.file_type;
                if overwritten {
                    continue;
                }
            }
            let action = FileSystemAction::delete(p);
            if p.file_type == FileType::Folder {
                plan.folder_deletes.push(action);
            } else {
                plan.deletes.push(action);
            }
        }

        let actions = self.order(plan);
        info!(actions = actions.len(), "planned file system actions");
        actions
    }

    fn order(&self, mut plan: Plan) -> Vec<FileSystemAction> {
        plan.relocations.sort_by(|a, b| a.from.cmp(&b.from));
        plan.deletes.sort_by(|a, b| a.path.cmp(&b.path));
        plan.folders.sort_by(|a, b| depth(&a.path).cmp(&depth(&b.path)).then_with(|| a.path.cmp(&b.path)));
        plan.writes.sort_by(|a, b| a.path.cmp(&b.path));
        plan.attributes.sort_by(|a, b| a.path.cmp(&b.path));
        plan.folder_deletes
            .sort_by(|a, b| depth(&b.path).cmp(&depth(&a.path)).then_with(|| a.path.cmp(&b.path)));

        let vacated: Vec<String> = plan.renames.iter().filter_map(|a| a.from.clone()).collect();
        let (blocked_folders, folders): (Vec<_>, Vec<_>) = plan
            .folders
            .into_iter()
            .partition(|a| vacated.iter().any(|from| within(&a.path, from)));
        let renames = self.order_renames(plan.renames);
        let removed_folders: HashSet<&str> = plan.folder_deletes.iter().map(|a| a.path.as_str()).collect();
        let (late, renames): (Vec<_>, Vec<_>) = renames
            .into_iter()
            .partition(|a| removed_folders.contains(a.path.as_str()));
        let (late_writes, writes): (Vec<_>, Vec<_>) = plan
            .writes
            .into_iter()
            .partition(|a| removed_folders.contains(a.path.as_str()));

        let mut actions = plan.relocations;
        actions.extend(plan.deletes);
        actions.extend(folders);
        actions.extend(renames);
        actions.extend(blocked_folders);
        actions.extend(writes);
        actions.extend(plan.attributes);
        actions.extend(plan.folder_deletes);
        actions.extend(late);
        actions.extend(late_writes);
        actions
    }

    /// A rename waits for the renames that move its destination, or an ancestor of it,
    /// away. When only cycles remain, one member is split through the staging directory.
    fn order_renames(&self, renames: Vec<FileSystemAction>) -> Vec<FileSystemAction> {
        let mut pending: BTreeMap<String, FileSystemAction> = renames
            .into_iter()
            .filter_map(|a| a.from.clone().map(|from| (from, a)))
            .collect();
        let mut ordered = Vec::with_capacity(pending.len());
        let mut unstaged = Vec::new();

        while !pending.is_empty() {
            let ready = pending
                .iter()
                .find(|(_, a)| !pending.keys().any(|from| within(&a.path, from)))
                .map(|(from, _)| from.clone());
            if let Some(from) = ready.and_then(|from| pending.remove(&from)) {
                ordered.push(from);
                continue;
            }
            let Some((_, action)) = pending.pop_first() else {
                break;
            };
            let history = action.history.map(|h| h.to_string()).unwrap_or_default();
            let staging = format!("{}/{}/{}", self.state_dir, STAGING_DIR, history);
            debug!(path = %action.path, %staging, "breaking rename cycle");
            ordered.push(FileSystemAction {
                path: staging.clone(),
                ..action.clone()
            });
            unstaged.push(FileSystemAction {
                from: Some(staging),
                ..action
            });
        }
        ordered.extend(unstaged);
        ordered
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// True if `path` is `base` or lies below it.
fn within(path: &str, base: &str) -> bool {
    path.strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tree::LocalEntry;
    use crate::model::FileStatus;
    use meshsync_reduce::DigestAlgorithm;

    fn rid() -> ReplicaId {
        ReplicaId::new("home").unwrap()
    }

    fn file(history: FileHistoryId, version: u64, path: &str, body: &str) -> FileVersion {
        FileVersion {
            history,
            version,
            path: path.into(),
            file_type: FileType::File,
            status: FileStatus::New,
            size: body.len() as u64,
            checksum: Some(DigestAlgorithm::Blake3.digest(body.as_bytes())),
            link_target: None,
            permissions: None,
        }
    }

    fn folder(history: FileHistoryId, path: &str) -> FileVersion {
        FileVersion {
            file_type: FileType::Folder,
            size: 0,
            checksum: None,
            ..file(history, 1, path, "")
        }
    }

    fn on_disk(entries: &[(&str, Option<&str>)]) -> LocalTree {
        LocalTree::from_entries(
            entries
                .iter()
                .map(|(path, body)| {
                    let entry = match body {
                        Some(body) => LocalEntry {
                            file_type: FileType::File,
                            size: body.len() as u64,
                            checksum: Some(DigestAlgorithm::Blake3.digest(body.as_bytes())),
                            link_target: None,
                            permissions: None,
                        },
                        None => LocalEntry {
                            file_type: FileType::Folder,
                            size: 0,
                            checksum: None,
                            link_target: None,
                            permissions: None,
                        },
                    };
                    (path.to_string(), entry)
                })
                .collect(),
        )
    }

    fn tree(versions: &[&FileVersion]) -> BTreeMap<FileHistoryId, FileVersion> {
        versions.iter().map(|v| (v.history, (*v).clone())).collect()
    }

    fn summary(actions: &[FileSystemAction]) -> Vec<String> {
        actions.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn parents_before_children_and_deletes_before_folder_removal() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (d, f, old_d, old_f) = (
            FileHistoryId::random(),
            FileHistoryId::random(),
            FileHistoryId::random(),
            FileHistoryId::random(),
        );
        let previous = tree(&[&folder(old_d, "old"), &file(old_f, 1, "old/x", "x")]);
        let target = tree(&[&folder(d, "new"), &file(f, 1, "new/y", "y")]);
        let disk = on_disk(&[("old", None), ("old/x", Some("x"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        assert_eq!(
            summary(&actions),
            vec!["Deleted old/x", "New new", "New new/y", "Deleted old"]
        );
    }

    #[test]
    fn satisfied_targets_produce_nothing() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let f = file(FileHistoryId::random(), 1, "a", "same");
        let disk = on_disk(&[("a", Some("same"))]);
        assert!(planner.plan(&BTreeMap::new(), &disk, &tree(&[&f]), &[]).is_empty());
    }

    #[test]
    fn rename_reuses_local_content() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let h = FileHistoryId::random();
        let before = file(h, 1, "a.txt", "body");
        let after = file(h, 2, "b.txt", "body");
        let disk = on_disk(&[("a.txt", Some("body"))]);
        let actions = planner.plan(&tree(&[&before]), &disk, &tree(&[&after]), &[]);
        assert_eq!(summary(&actions), vec!["Renamed a.txt -> b.txt"]);
    }

    #[test]
    fn untracked_occupant_is_moved_aside() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let t = file(FileHistoryId::random(), 1, "notes.md", "remote");
        let disk = on_disk(&[("notes.md", Some("local draft"))]);
        let actions = planner.plan(&BTreeMap::new(), &disk, &tree(&[&t]), &[]);
        assert_eq!(
            summary(&actions),
            vec![
                "Renamed notes.md -> notes (conflicted copy, home, 0).md",
                "New notes.md"
            ]
        );
    }

    #[test]
    fn tracked_unmodified_file_is_overwritten() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let h = FileHistoryId::random();
        let disk = on_disk(&[("a", Some("v1"))]);
        let actions = planner.plan(
            &tree(&[&file(h, 1, "a", "v1")]),
            &disk,
            &tree(&[&file(h, 2, "a", "v2")]),
            &[],
        );
        assert_eq!(summary(&actions), vec!["Changed a"]);
    }

    #[test]
    fn locally_modified_file_is_preserved() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let h = FileHistoryId::random();
        let disk = on_disk(&[("a", Some("edited"))]);
        let actions = planner.plan(
            &tree(&[&file(h, 1, "a", "v1")]),
            &disk,
            &tree(&[&file(h, 2, "a", "v2")]),
            &[],
        );
        assert_eq!(
            summary(&actions),
            vec!["Renamed a -> a (conflicted copy, home, 1)", "Changed a"]
        );
    }

    #[test]
    fn losing_local_version_becomes_conflict_copy() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let h = FileHistoryId::random();
        let mine = file(h, 2, "plan.txt", "mine");
        let theirs = file(h, 2, "plan.txt", "theirs");
        let disk = on_disk(&[("plan.txt", Some("mine"))]);
        let actions = planner.plan(&tree(&[&mine]), &disk, &tree(&[&theirs]), &[mine.clone()]);
        assert_eq!(
            summary(&actions),
            vec![
                "Renamed plan.txt -> plan (conflicted copy, home, 2).txt",
                "Changed plan.txt"
            ]
        );
    }

    #[test]
    fn deletion_skips_modified_files() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (a, b) = (FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(a, 1, "a", "a"), &file(b, 1, "b", "b")]);
        let disk = on_disk(&[("a", Some("a")), ("b", Some("changed"))]);
        let actions = planner.plan(&previous, &disk, &BTreeMap::new(), &[]);
        assert_eq!(summary(&actions), vec!["Deleted a"]);
    }

    #[test]
    fn swap_is_broken_through_staging() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (a, b) = (FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(a, 1, "x", "A"), &file(b, 1, "y", "B")]);
        let target = tree(&[&file(a, 2, "y", "A"), &file(b, 2, "x", "B")]);
        let disk = on_disk(&[("x", Some("A")), ("y", Some("B"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| a.kind == ActionKind::Renamed));
        assert_eq!(actions[0].from.as_deref(), Some("x"));
        assert!(actions[0].path.starts_with(".meshsync/staging/"));
        assert_eq!(actions[1].from.as_deref(), Some("y"));
        assert_eq!(actions[1].path, "x");
        assert_eq!(actions[2].from.as_deref(), Some(actions[0].path.as_str()));
        assert_eq!(actions[2].path, "y");
    }

    #[test]
    fn rename_chain_moves_destination_first() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (a, b) = (FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(a, 1, "1", "A"), &file(b, 1, "2", "B")]);
        let target = tree(&[&file(a, 2, "2", "A"), &file(b, 2, "3", "B")]);
        let disk = on_disk(&[("1", Some("A")), ("2", Some("B"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        assert_eq!(summary(&actions), vec!["Renamed 2 -> 3", "Renamed 1 -> 2"]);
    }

    #[test]
    fn folder_waits_for_file_renamed_off_its_path() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (h1, h2, h3) = (FileHistoryId::random(), FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(h1, 1, "a", "A")]);
        let target = tree(&[&file(h1, 2, "b", "A"), &folder(h2, "a"), &file(h3, 1, "a/c", "C")]);
        let disk = on_disk(&[("a", Some("A"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        assert_eq!(summary(&actions), vec!["Renamed a -> b", "New a", "New a/c"]);
    }

    #[test]
    fn new_file_waits_for_file_renamed_off_its_path() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (h1, h2) = (FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(h1, 1, "a", "A")]);
        let target = tree(&[&file(h1, 2, "b", "A"), &file(h2, 1, "a", "other")]);
        let disk = on_disk(&[("a", Some("A"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        assert_eq!(summary(&actions), vec!["Renamed a -> b", "New a"]);
    }

    #[test]
    fn file_moving_below_its_own_path_goes_through_staging() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (h1, h2) = (FileHistoryId::random(), FileHistoryId::random());
        let previous = tree(&[&file(h1, 1, "b", "B")]);
        let target = tree(&[&file(h1, 2, "b/y", "B"), &folder(h2, "b")]);
        let disk = on_disk(&[("b", Some("B"))]);
        let actions = planner.plan(&previous, &disk, &target, &[]);
        let staging = format!(".meshsync/staging/{h1}");
        assert_eq!(
            summary(&actions),
            vec![
                format!("Renamed b -> {staging}"),
                format!("Renamed {staging} -> b/y"),
                "New b".to_string(),
            ]
        );
    }

    #[test]
    fn within_matches_whole_components() {
        assert!(within("a", "a"));
        assert!(within("a/b", "a"));
        assert!(!within("ab", "a"));
        assert!(!within("a", "a/b"));
    }

    #[test]
    fn folder_replaced_by_file_is_removed_first() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let (d, f) = (FileHistoryId::random(), FileHistoryId::random());
        let disk = on_disk(&[("thing", None)]);
        let actions = planner.plan(
            &tree(&[&folder(d, "thing")]),
            &disk,
            &tree(&[&file(f, 1, "thing", "now a file")]),
            &[],
        );
        assert_eq!(summary(&actions), vec!["Deleted thing", "New thing"]);
    }

    #[test]
    fn unsafe_targets_are_refused() {
        let r = rid();
        let planner = FileSystemActionReconciler::new(&r, ".meshsync");
        let bad = file(FileHistoryId::random(), 1, "../escape", "x");
        let state = file(FileHistoryId::random(), 1, ".meshsync/evil", "x");
        let actions = planner.plan(&BTreeMap::new(), &LocalTree::default(), &tree(&[&bad, &state]), &[]);
        assert!(actions.is_empty());
    }
}
