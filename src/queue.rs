//! The persisted request queue feeding the setup workers.
//!
//! FIFO, backed by `queue.json`. The backing file is rewritten on every
//! mutation and is the authoritative state on startup: requests that were
//! never handed to a worker are replayed after a restart, requests already
//! returned by `get` are gone.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Where a review's commits come from. Exactly one kind per request; the
/// serialized form uses the submission's field names (`hash`, `patches`,
/// `patchwork_series_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "hash")]
    Hash(String),
    #[serde(rename = "patches")]
    Patches(Vec<String>),
    #[serde(rename = "patchwork_series_id")]
    Series(u64),
}

/// One queued review request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub review_id: String,
    pub token: String,
    pub tree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mask: Vec<bool>,
    #[serde(flatten)]
    pub origin: Origin,
    /// Patch-count estimate used for queue-position reporting; the real
    /// count is only known after setup.
    #[serde(default = "default_patch_count")]
    pub patch_count: usize,
}

fn default_patch_count() -> usize {
    1
}

pub struct ReviewQueue {
    path: PathBuf,
    items: Mutex<VecDeque<ReviewRequest>>,
    available: Condvar,
}

impl ReviewQueue {
    /// Loads the queue from its backing file. A corrupt file is moved aside
    /// to `<path>.corrupt` and the queue starts empty.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<ReviewQueue> {
        let path = path.into();

        let items = match fs_err::read(&path) {
            Ok(contents) => match serde_json::from_slice::<Vec<ReviewRequest>>(&contents) {
                Ok(items) => VecDeque::from(items),
                Err(e) => {
                    let quarantine = path.with_extension("json.corrupt");
                    log::warn!(
                        "Queue file {} is corrupt ({e}); moving it to {}",
                        path.display(),
                        quarantine.display()
                    );
                    fs_err::rename(&path, &quarantine)?;
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };

        if !items.is_empty() {
            log::info!("Replaying {} queued request(s) from {}", items.len(), path.display());
        }

        Ok(ReviewQueue {
            path,
            items: Mutex::new(items),
            available: Condvar::new(),
        })
    }

    /// Appends a request and persists the queue before returning. On a save
    /// failure the request stays queued in memory and the error surfaces to
    /// the caller.
    pub fn put(&self, request: ReviewRequest) -> anyhow::Result<()> {
        let mut items = self.items.lock().unwrap();
        items.push_back(request);
        let result = self.save(&items);
        self.available.notify_one();
        result
    }

    /// Blocks until a request is available or the timeout elapses. The
    /// returned request is removed from memory and from the backing file
    /// before this returns.
    pub fn get(&self, timeout: Duration) -> Option<ReviewRequest> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().unwrap();

        loop {
            if let Some(request) = items.pop_front() {
                if let Err(e) = self.save(&items) {
                    // The request is already handed out; it must not be
                    // replayed, so the stale file is the lesser evil.
                    log::error!("Failed to persist queue after get: {e}");
                }
                return Some(request);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self.available.wait_timeout(items, remaining).unwrap();
            items = guard;
        }
    }

    /// Position of a review in the queue plus the sum of `patch_count`
    /// over the requests strictly ahead of it.
    pub fn peek_ahead(&self, review_id: &str) -> Option<(usize, usize)> {
        let items = self.items.lock().unwrap();
        let index = items
            .iter()
            .position(|request| request.review_id == review_id)?;
        let patches_ahead = items
            .iter()
            .take(index)
            .map(|request| request.patch_count)
            .sum();
        Some((index, patches_ahead))
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, items: &VecDeque<ReviewRequest>) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(&items.iter().collect::<Vec<_>>())?;

        let parent = self.path.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut temp, &contents)?;
        temp.persist(&self.path)?;
        Ok(())
    }
}
