//! Setup workers: each one owns a pinned work tree and turns queued review
//! requests into ready-to-review snapshots.
//!
//! A request walks through: mark in-progress, configure the remote, derive
//! the commit list from the origin, record the patch count, optionally
//! index the range, then emit one snapshot per unmasked commit. Any setup
//! failure is fatal for the whole review; snapshot-level failures only cost
//! that slot.

use std::{
    io::Write as _,
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use thiserror::Error;

use crate::{
    config::Config,
    patchwork::SeriesSource,
    process,
    queue::{Origin, ReviewQueue, ReviewRequest},
    snapshot_queue::{Snapshot, SnapshotQueue},
    storage::{ReviewStatus, ReviewStorage},
    worktree::{self, WorktreeManager},
};

/// Fatal setup failures. The Display strings double as the review's
/// user-visible message file.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to setup git remote")]
    Remote,

    #[error("Failed to fetch remote {0}")]
    Fetch(String),

    #[error("Failed to determine default branch for {0}")]
    DefaultBranch(String),

    #[error("Commit {0} not found")]
    CommitNotFound(String),

    #[error("Failed to reset to {0}")]
    ResetBase(String),

    #[error("Failed to apply patch {num}: {stderr}")]
    ApplyPatch { num: usize, stderr: String },

    #[error("Patchwork not configured")]
    TrackerUnconfigured,

    #[error("Failed to fetch patchwork series {0}: {1}")]
    TrackerFetch(u64, String),

    #[error("Failed to run indexer")]
    Indexer,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SetupWorker {
    config: Arc<Config>,
    worktrees: Arc<WorktreeManager>,
    storage: Arc<ReviewStorage>,
    snapshots: Arc<SnapshotQueue>,
    tracker: Option<Arc<dyn SeriesSource>>,
    tree_id: usize,
}

impl SetupWorker {
    pub fn new(
        config: Arc<Config>,
        worktrees: Arc<WorktreeManager>,
        storage: Arc<ReviewStorage>,
        snapshots: Arc<SnapshotQueue>,
        tracker: Option<Arc<dyn SeriesSource>>,
        tree_id: usize,
    ) -> SetupWorker {
        SetupWorker {
            config,
            worktrees,
            storage,
            snapshots,
            tracker,
            tree_id,
        }
    }

    /// Worker loop. One request at a time; errors are contained to the
    /// request that caused them.
    pub fn run(&self, queue: &ReviewQueue, running: &AtomicBool) {
        log::info!("Setup worker started with work tree {}", self.tree_id);

        while running.load(Ordering::Relaxed) {
            let Some(request) = queue.get(Duration::from_secs(1)) else {
                continue;
            };

            log::info!(
                "Processing review {} on work tree {}",
                request.review_id,
                self.tree_id
            );

            if let Err(e) = self.process_request(&request) {
                log::error!("Setup failed for review {}: {e}", request.review_id);
                let message = e.to_string();
                if let Err(e) =
                    self.storage
                        .set_status(&request.review_id, ReviewStatus::Error, Some(&message))
                {
                    log::error!("Failed to record error status: {e}");
                }
                if let Err(e) =
                    self.storage
                        .write_message(&request.token, &request.review_id, &message)
                {
                    log::error!("Failed to write message file: {e}");
                }
            }
        }
    }

    fn process_request(&self, request: &ReviewRequest) -> Result<(), SetupError> {
        let review_id = &request.review_id;

        self.storage
            .set_status(review_id, ReviewStatus::InProgress, None)
            .map_err(SetupError::Other)?;

        let (remote, branch) = self.configure_remote(request)?;
        let (commits, range) = self.derive_commits(request, &remote, &branch)?;

        self.storage
            .set_patch_count(review_id, commits.len())
            .map_err(SetupError::Other)?;

        if let Some(indexer) = &self.config.indexer {
            self.run_indexer(indexer, &range)?;
        }

        self.emit_snapshots(request, &commits);

        log::info!(
            "Setup complete for review {review_id}, {} patch(es) derived",
            commits.len()
        );
        Ok(())
    }

    /// Registers the tree's remote, fetches it, and resolves the branch to
    /// base raw patches on.
    fn configure_remote(&self, request: &ReviewRequest) -> Result<(String, String), SetupError> {
        let remote = request.tree.clone();
        let url = self
            .config
            .remote_url_template
            .replace("{tree}", &request.tree);

        if !self.worktrees.add_remote(&remote, &url) {
            return Err(SetupError::Remote);
        }
        if !self.worktrees.fetch(self.tree_id, &remote) {
            return Err(SetupError::Fetch(remote));
        }

        let branch = match &request.branch {
            Some(branch) => branch.clone(),
            None => self
                .worktrees
                .default_branch(self.tree_id, &remote)
                .ok_or_else(|| SetupError::DefaultBranch(remote.clone()))?,
        };

        Ok((remote, branch))
    }

    /// Produces the ordered commit list (patch 1 = oldest) and the git
    /// range covering it.
    fn derive_commits(
        &self,
        request: &ReviewRequest,
        remote: &str,
        branch: &str,
    ) -> Result<(Vec<String>, String), SetupError> {
        let wt_path = self
            .worktrees
            .path(self.tree_id)
            .ok_or_else(|| anyhow::anyhow!("work tree {} not found", self.tree_id))?
            .to_path_buf();

        if let Origin::Hash(hash) = &request.origin {
            let range = if hash.contains("..") {
                hash.clone()
            } else {
                format!("{hash}^..{hash}")
            };

            for endpoint in hash.split("..").filter(|part| !part.is_empty()) {
                if !self.worktrees.commit_exists(self.tree_id, endpoint) {
                    return Err(SetupError::CommitNotFound(endpoint.to_string()));
                }
            }

            let commits = worktree::rev_list_reversed(&wt_path, &range)?;
            return Ok((commits, range));
        }

        // Raw patches and tracker series both apply onto the branch tip.
        let base_ref = format!("{remote}/{branch}");
        if !self.worktrees.reset_hard(&wt_path, &base_ref) {
            return Err(SetupError::ResetBase(base_ref));
        }

        let patches = match &request.origin {
            Origin::Patches(patches) => patches.clone(),
            Origin::Series(series_id) => {
                let tracker = self
                    .tracker
                    .as_ref()
                    .ok_or(SetupError::TrackerUnconfigured)?;
                let mbox = tracker
                    .series_mbox(*series_id)
                    .map_err(|e| SetupError::TrackerFetch(*series_id, e.to_string()))?;
                vec![mbox]
            }
            Origin::Hash(_) => unreachable!("hash origin handled above"),
        };

        let commits =
            self.apply_patches(&wt_path, &patches, &request.token, &request.review_id)?;
        let range = format!("{base_ref}..HEAD");
        Ok((commits, range))
    }

    /// Applies each patch text with `git am`; an mbox may create several
    /// commits, all of which get their own patch slot in apply order.
    fn apply_patches(
        &self,
        wt_path: &std::path::Path,
        patches: &[String],
        token: &str,
        review_id: &str,
    ) -> Result<Vec<String>, SetupError> {
        let mut commit_hashes: Vec<String> = Vec::new();

        for (i, patch) in patches.iter().enumerate() {
            let num = i + 1;

            let mut mbox = tempfile::Builder::new()
                .prefix("revue-mbox-")
                .suffix(".patch")
                .tempfile()
                .map_err(|e| SetupError::Other(e.into()))?;
            mbox.write_all(patch.as_bytes())
                .map_err(|e| SetupError::Other(e.into()))?;

            let head_before = worktree::rev_parse_head(wt_path)?;

            worktree::apply_mbox(wt_path, mbox.path())
                .map_err(|stderr| SetupError::ApplyPatch { num, stderr })?;

            let new_commits =
                worktree::rev_list_reversed(wt_path, &format!("{head_before}..HEAD"))?;

            let first_slot = commit_hashes.len() + 1;
            for offset in 0..new_commits.len() {
                self.storage
                    .write_patch_file(token, review_id, first_slot + offset, patch)
                    .map_err(SetupError::Other)?;
            }

            commit_hashes.extend(new_commits);
        }

        Ok(commit_hashes)
    }

    fn run_indexer(
        &self,
        indexer: &crate::config::IndexerConfig,
        range: &str,
    ) -> Result<(), SetupError> {
        let wt_path = self
            .worktrees
            .path(self.tree_id)
            .ok_or_else(|| anyhow::anyhow!("work tree {} not found", self.tree_id))?;

        log::info!("Running {} over {range}", indexer.command);

        let mut cmd = Command::new(&indexer.command);
        cmd.args(["-s", ".", "--git", range])
            .current_dir(wt_path)
            .stdout(std::process::Stdio::null());

        match process::run_with_timeout(&mut cmd, indexer.timeout) {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) if outcome.timed_out => {
                log::warn!("{} timed out", indexer.command);
                Err(SetupError::Indexer)
            }
            Ok(outcome) => {
                log::warn!("{} failed: {}", indexer.command, outcome.stderr_lossy());
                Err(SetupError::Indexer)
            }
            Err(e) => {
                log::warn!("Failed to run {}: {e}", indexer.command);
                Err(SetupError::Indexer)
            }
        }
    }

    /// Emits one snapshot per commit, honoring the mask. Slot-level
    /// failures mark the slot failed and move on; the request as a whole
    /// proceeds.
    fn emit_snapshots(&self, request: &ReviewRequest, commits: &[String]) {
        for (i, commit_hash) in commits.iter().enumerate() {
            let patch_num = i + 1;

            if request.mask.get(i) == Some(&false) {
                log::info!(
                    "Skipping masked patch {patch_num} for review {}",
                    request.review_id
                );
                if let Err(e) =
                    self.storage
                        .mark_patch_complete(&request.review_id, patch_num, true)
                {
                    log::error!("Failed to mark masked patch complete: {e}");
                }
                continue;
            }

            let snapshot_path = match self.worktrees.create_snapshot(self.tree_id, commit_hash) {
                Ok(path) => path,
                Err(e) => {
                    log::error!("Failed to snapshot {commit_hash}: {e}");
                    self.fail_slot(request, patch_num);
                    continue;
                }
            };

            if !self.worktrees.reset_hard(&snapshot_path, commit_hash) {
                log::error!("Failed to reset snapshot to {commit_hash}");
                self.worktrees.remove_snapshot(&snapshot_path);
                self.fail_slot(request, patch_num);
                continue;
            }

            let snapshot = Snapshot {
                path: snapshot_path.clone(),
                token: request.token.clone(),
                review_id: request.review_id.clone(),
                patch_num,
                commit_hash: commit_hash.clone(),
            };

            // Blocks while the queue is full: LLM saturation propagates
            // back here as back-pressure.
            if !self.snapshots.put(snapshot) {
                log::warn!("Snapshot queue closed; abandoning review {}", request.review_id);
                self.worktrees.remove_snapshot(&snapshot_path);
                return;
            }

            log::info!(
                "Queued snapshot for review {} patch {patch_num}",
                request.review_id
            );

            // Let the consumer pick the snapshot up before the next copy
            // starts churning the disk.
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn fail_slot(&self, request: &ReviewRequest, patch_num: usize) {
        if let Err(e) = self
            .storage
            .mark_patch_complete(&request.review_id, patch_num, false)
        {
            log::error!("Failed to mark patch {patch_num} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_match_the_reported_shapes() {
        assert_eq!(
            SetupError::ApplyPatch {
                num: 2,
                stderr: "corrupt patch".to_string()
            }
            .to_string(),
            "Failed to apply patch 2: corrupt patch"
        );
        assert_eq!(
            SetupError::CommitNotFound("abc123".to_string()).to_string(),
            "Commit abc123 not found"
        );
        assert_eq!(
            SetupError::TrackerUnconfigured.to_string(),
            "Patchwork not configured"
        );
        assert_eq!(
            SetupError::ResetBase("net-next/main".to_string()).to_string(),
            "Failed to reset to net-next/main"
        );
    }
}
