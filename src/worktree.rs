//! Work-tree management: a fixed table of detached git work trees carved out
//! of one shared repository, plus copy-on-write snapshotting of those trees.
//!
//! Per-tree operations take no lock: every setup worker is the sole mutator
//! of its pinned tree. Repository-global mutation (adding remotes) is
//! serialized behind one mutex.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Mutex,
};

use anyhow::Context;

pub struct WorktreeManager {
    git_tree: PathBuf,
    trees: Vec<PathBuf>,
    repo_lock: Mutex<()>,
    reflink: bool,
}

impl WorktreeManager {
    /// Ensures `count` work trees exist under the shared repository, named
    /// `wt-1` .. `wt-<count>`, each a detached checkout. Idempotent.
    pub fn init(git_tree: impl Into<PathBuf>, count: usize) -> anyhow::Result<WorktreeManager> {
        let git_tree = git_tree.into();

        let reflink = detect_reflink(&git_tree);
        if reflink {
            log::info!("Snapshot copies will use reflinks");
        } else {
            log::info!("Reflinks unavailable; snapshot copies will be full copies");
        }

        let mut trees = Vec::with_capacity(count);
        for id in 1..=count {
            let name = format!("wt-{id}");
            let path = git_tree.join(&name);

            if !path.exists() {
                log::info!("Creating work tree {} at {}", name, path.display());
                let output = Command::new("git")
                    .args(["worktree", "add", "--detach", &name])
                    .current_dir(&git_tree)
                    .output()
                    .context("Failed to run git worktree add")?;
                if !output.status.success() {
                    anyhow::bail!(
                        "git worktree add {} failed: {}",
                        name,
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
            }

            trees.push(path);
        }

        Ok(WorktreeManager {
            git_tree,
            trees,
            repo_lock: Mutex::new(()),
            reflink,
        })
    }

    pub fn count(&self) -> usize {
        self.trees.len()
    }

    /// Work-tree ids are 1-based.
    pub fn path(&self, id: usize) -> Option<&Path> {
        self.trees.get(id.checked_sub(1)?).map(PathBuf::as_path)
    }

    /// Adds a remote to the shared repository. Serialized behind the
    /// repository lock; a no-op when the remote already exists.
    pub fn add_remote(&self, name: &str, url: &str) -> bool {
        let _guard = self.repo_lock.lock().unwrap();

        let exists = Command::new("git")
            .args(["remote", "get-url", name])
            .current_dir(&self.git_tree)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if exists {
            log::debug!("Remote {name} already exists");
            return true;
        }

        match Command::new("git")
            .args(["remote", "add", name, url])
            .current_dir(&self.git_tree)
            .output()
        {
            Ok(output) if output.status.success() => {
                log::info!("Added remote {name}: {url}");
                true
            }
            Ok(output) => {
                log::warn!(
                    "git remote add {name} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                log::warn!("Failed to run git remote add: {e}");
                false
            }
        }
    }

    pub fn fetch(&self, id: usize, remote: &str) -> bool {
        let Some(wt_path) = self.path(id) else {
            return false;
        };

        match Command::new("git")
            .args(["fetch", remote])
            .current_dir(wt_path)
            .output()
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::warn!(
                    "git fetch {remote} failed in {}: {}",
                    wt_path.display(),
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                log::warn!("Failed to run git fetch: {e}");
                false
            }
        }
    }

    /// Forces the tree at `path` (a work tree or a snapshot) to `git_ref`.
    pub fn reset_hard(&self, path: &Path, git_ref: &str) -> bool {
        match Command::new("git")
            .args(["reset", "--hard", git_ref])
            .current_dir(path)
            .output()
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::warn!(
                    "git reset --hard {git_ref} failed in {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                log::warn!("Failed to run git reset: {e}");
                false
            }
        }
    }

    pub fn commit_exists(&self, id: usize, commit_hash: &str) -> bool {
        let Some(wt_path) = self.path(id) else {
            return false;
        };

        Command::new("git")
            .args(["cat-file", "-e", commit_hash])
            .current_dir(wt_path)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Resolves the remote's default branch: the symbolic HEAD ref when set,
    /// otherwise parsed out of `git remote show`. Returns the final path
    /// component only (`main`, `master`, ...).
    pub fn default_branch(&self, id: usize, remote: &str) -> Option<String> {
        let wt_path = self.path(id)?;

        let output = Command::new("git")
            .args(["symbolic-ref", &format!("refs/remotes/{remote}/HEAD")])
            .current_dir(wt_path)
            .output()
            .ok()?;
        if output.status.success() {
            let full_ref = String::from_utf8_lossy(&output.stdout);
            let branch = full_ref.trim().rsplit('/').next()?.to_string();
            if !branch.is_empty() {
                return Some(branch);
            }
        }

        // `git remote show` prints a "HEAD branch:" line even for remotes
        // that were added after clone.
        let output = Command::new("git")
            .args(["remote", "show", remote])
            .current_dir(wt_path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some((_, branch)) = line.split_once("HEAD branch:") {
                let branch = branch.trim();
                if !branch.is_empty() {
                    return Some(branch.to_string());
                }
            }
        }

        None
    }

    /// Copies work tree `id` to a sibling directory suffixed with the first
    /// 12 characters of the commit hash. The caller must immediately
    /// `reset_hard` the snapshot to that commit.
    pub fn create_snapshot(&self, id: usize, commit_hash: &str) -> anyhow::Result<PathBuf> {
        let wt_path = self
            .path(id)
            .with_context(|| format!("Work tree {id} not found"))?;

        let short_hash = commit_hash.get(..12).unwrap_or(commit_hash);
        let snapshot_path = PathBuf::from(format!("{}.{}", wt_path.display(), short_hash));

        // A leftover from a crashed run would make cp copy into it instead
        // of creating it.
        if snapshot_path.exists() {
            log::debug!("Removing stale snapshot {}", snapshot_path.display());
            fs_err::remove_dir_all(&snapshot_path)?;
        }

        log::debug!("Creating snapshot {}", snapshot_path.display());

        let cp = Command::new("cp")
            .arg("-a")
            .arg("--reflink=auto")
            .arg(wt_path)
            .arg(&snapshot_path)
            .output();

        match cp {
            Ok(output) if output.status.success() => Ok(snapshot_path),
            other => {
                if let Ok(output) = other {
                    log::debug!(
                        "cp --reflink failed ({}), copying recursively",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                } else {
                    log::debug!("cp unavailable, copying recursively");
                }
                let _ = fs_err::remove_dir_all(&snapshot_path);
                copy_tree(wt_path, &snapshot_path).with_context(|| {
                    format!("Failed to copy work tree to {}", snapshot_path.display())
                })?;
                Ok(snapshot_path)
            }
        }
    }

    /// Best-effort recursive delete; never fails.
    pub fn remove_snapshot(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        log::debug!("Removing snapshot {}", path.display());
        if let Err(e) = fs_err::remove_dir_all(path) {
            log::warn!("Failed to remove snapshot {}: {e}", path.display());
        }
    }

    pub fn uses_reflink(&self) -> bool {
        self.reflink
    }
}

/// Resolves `HEAD` in the tree at `path` to a full hash.
pub fn rev_parse_head(path: &Path) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(path)
        .output()
        .context("Failed to run git rev-parse")?;
    if !output.status.success() {
        anyhow::bail!(
            "git rev-parse HEAD failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Expands a git range to commit hashes, oldest first.
pub fn rev_list_reversed(path: &Path, range: &str) -> anyhow::Result<Vec<String>> {
    let output = Command::new("git")
        .args(["rev-list", range])
        .current_dir(path)
        .output()
        .context("Failed to run git rev-list")?;
    if !output.status.success() {
        anyhow::bail!(
            "git rev-list {range} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut hashes: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    // rev-list returns newest first; patch numbering is oldest first.
    hashes.reverse();
    Ok(hashes)
}

/// Applies a mailbox file with `git am`. On failure the in-progress apply is
/// aborted so the tree stays usable, and the collected stderr is returned.
pub fn apply_mbox(path: &Path, mbox: &Path) -> Result<(), String> {
    let output = Command::new("git")
        .arg("am")
        .arg(mbox)
        .current_dir(path)
        .output()
        .map_err(|e| format!("failed to run git am: {e}"))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let _ = Command::new("git")
        .args(["am", "--abort"])
        .current_dir(path)
        .output();
    Err(stderr)
}

/// Probes whether `cp --reflink=always` works on the filesystem holding
/// `dir`. Only used for the startup capability report; actual snapshot
/// copies use `--reflink=auto` and degrade on their own.
fn detect_reflink(dir: &Path) -> bool {
    let Ok(probe) = tempfile::tempdir_in(dir) else {
        return false;
    };
    let src = probe.path().join("probe-src");
    let dst = probe.path().join("probe-dst");
    if std::fs::write(&src, b"reflink probe").is_err() {
        return false;
    }
    Command::new("cp")
        .arg("--reflink=always")
        .arg(&src)
        .arg(&dst)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs_err::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = fs_err::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
            #[cfg(not(unix))]
            {
                fs_err::copy(entry.path(), &target)?;
            }
        } else {
            fs_err::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
