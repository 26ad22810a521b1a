//! The service orchestrator: owns the storage, queues, work trees, and
//! worker pools, and exposes the submit/get/list/status surface the HTTP
//! layer calls into.
//!
//! Construction and worker startup are split so a restarted process can
//! rebuild its state (and replay the persisted queue) before any worker
//! touches it.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::{
    config::Config,
    patchwork::{PatchworkClient, SeriesSource},
    queue::{Origin, ReviewQueue, ReviewRequest},
    snapshot_queue::SnapshotQueue,
    storage::{ReviewFormat, ReviewStorage},
    web::interface::{ReviewDetails, ReviewSummary, StatusResponse, SubmitRequest},
    worker_pool::WorkerPool,
    worktree::WorktreeManager,
};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Exactly one of patchwork_series_id, patches, or hash must be provided")]
    OriginConflict,

    #[error("tree is required")]
    MissingTree,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SubmitError {
    /// Input errors are the client's fault and map to 400.
    pub fn is_input_error(&self) -> bool {
        matches!(self, SubmitError::OriginConflict | SubmitError::MissingTree)
    }
}

pub struct Service {
    config: Arc<Config>,
    storage: Arc<ReviewStorage>,
    queue: Arc<ReviewQueue>,
    snapshots: Arc<SnapshotQueue>,
    worktrees: Arc<WorktreeManager>,
    tracker: Option<Arc<dyn SeriesSource>>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Service {
    /// Builds every component and replays the persisted request queue.
    /// Workers are not running yet; call [`Service::start`].
    pub fn new(config: Config) -> anyhow::Result<Service> {
        fs_err::create_dir_all(&config.results_path)?;

        let storage = Arc::new(ReviewStorage::open(&config.results_path)?);
        let queue = Arc::new(ReviewQueue::load(storage.queue_path())?);
        let worktrees = Arc::new(WorktreeManager::init(
            &config.git_tree,
            config.max_work_trees,
        )?);

        // Twice the LLM pool: enough to hide setup stalls, small enough to
        // cap snapshot directories on disk.
        let snapshots = Arc::new(SnapshotQueue::new(config.max_review_runs * 2));

        let tracker: Option<Arc<dyn SeriesSource>> = config
            .patchwork
            .as_ref()
            .map(|patchwork| Arc::new(PatchworkClient::new(&patchwork.url)) as _);
        if tracker.is_some() {
            log::info!("Patchwork integration enabled");
        }

        log::info!(
            "Service initialized: {} work tree(s), {} review run(s)",
            config.max_work_trees,
            config.max_review_runs
        );

        Ok(Service {
            config: Arc::new(config),
            storage,
            queue,
            snapshots,
            worktrees,
            tracker,
            workers: Mutex::new(None),
        })
    }

    /// Replaces the tracker client; used by tests to avoid the network.
    pub fn set_tracker(&mut self, tracker: Arc<dyn SeriesSource>) {
        self.tracker = Some(tracker);
    }

    /// Starts both worker pools. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if workers.is_some() {
            return Ok(());
        }
        *workers = Some(WorkerPool::start(
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            Arc::clone(&self.queue),
            Arc::clone(&self.snapshots),
            Arc::clone(&self.worktrees),
            self.tracker.clone(),
        )?);
        Ok(())
    }

    /// Stops the worker pools, blocking until every thread exits.
    pub fn stop(&self) {
        drop(self.workers.lock().unwrap().take());
    }

    /// Validates a submission, creates the review record, and enqueues the
    /// request. Returns the new review id.
    pub fn submit(&self, submission: &SubmitRequest, token: &str) -> Result<String, SubmitError> {
        let origin = origin_from_submission(submission)?;
        let tree = submission
            .tree
            .as_deref()
            .filter(|tree| !tree.is_empty())
            .ok_or(SubmitError::MissingTree)?;

        let review_id = self
            .storage
            .create(token, tree, submission.branch.as_deref(), &origin)?;

        let patch_count = self.estimate_patch_count(&origin);

        let request = ReviewRequest {
            review_id: review_id.clone(),
            token: token.to_string(),
            tree: tree.to_string(),
            branch: submission.branch.clone(),
            mask: submission.mask.clone().unwrap_or_default(),
            origin,
            patch_count,
        };

        self.queue.put(request)?;

        log::info!("Submitted review {review_id} ({patch_count} patch(es) estimated)");
        Ok(review_id)
    }

    /// Queue-position estimates only; the real patch count is derived
    /// during setup.
    fn estimate_patch_count(&self, origin: &Origin) -> usize {
        match origin {
            Origin::Hash(_) => 1,
            Origin::Patches(patches) => patches.len().max(1),
            Origin::Series(series_id) => self
                .tracker
                .as_ref()
                .and_then(|tracker| tracker.series_patch_count(*series_id).ok())
                .filter(|count| *count > 0)
                .unwrap_or(1),
        }
    }

    /// Builds the full record for `GET /api/review`. Returns `None` for
    /// unknown ids and for records the token does not own (unless
    /// superuser), indistinguishably.
    pub fn get_review(
        &self,
        review_id: &str,
        token: &str,
        format: Option<ReviewFormat>,
        superuser: bool,
    ) -> anyhow::Result<Option<ReviewDetails>> {
        let Some(record) = self.storage.get(review_id)? else {
            return Ok(None);
        };

        if record.token != token && !superuser {
            return Ok(None);
        }

        let message = self
            .storage
            .read_message(&record.token, review_id)
            .or_else(|| record.message.clone());

        let queue_len = if record.status == crate::storage::ReviewStatus::Queued {
            Some(
                self.queue
                    .peek_ahead(review_id)
                    .map(|(_, patches_ahead)| patches_ahead)
                    .unwrap_or(0),
            )
        } else {
            None
        };

        let review = match format {
            Some(format) if record.status.is_terminal() => Some(
                (1..=record.patch_count)
                    .map(|patch_num| {
                        self.storage
                            .read_review_file(&record.token, review_id, patch_num, format)
                    })
                    .collect(),
            ),
            _ => None,
        };

        Ok(Some(ReviewDetails {
            review_id: record.id,
            tree: record.tree,
            status: record.status,
            date: record.date,
            patchwork_series_id: record.patchwork_series_id,
            hash: record.hash,
            branch: record.branch,
            start: record.start,
            start_llm: record.start_llm,
            end: record.end,
            message,
            patch_count: (record.patch_count > 0).then_some(record.patch_count),
            completed_patches: (record.completed_patches > 0).then_some(record.completed_patches),
            queue_len,
            review,
        }))
    }

    pub fn list_reviews(
        &self,
        token: &str,
        limit: usize,
        all_tokens: bool,
    ) -> anyhow::Result<Vec<ReviewSummary>> {
        let records = self.storage.list(token, limit, all_tokens)?;
        Ok(records
            .into_iter()
            .map(|record| ReviewSummary {
                review_id: record.id,
                status: record.status,
                date: record.date,
                tree: record.tree,
                patch_count: record.patch_count,
            })
            .collect())
    }

    pub fn status(&self) -> anyhow::Result<StatusResponse> {
        Ok(StatusResponse {
            service: "revue".to_string(),
            status: "running".to_string(),
            queue_size: self.queue.len(),
            max_work_trees: self.config.max_work_trees,
            max_claude_runs: self.config.max_review_runs,
            review_counts: self.storage.status_counts()?,
        })
    }

    pub fn storage(&self) -> &ReviewStorage {
        &self.storage
    }

    pub fn snapshot_queue(&self) -> &SnapshotQueue {
        &self.snapshots
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Enforces origin uniqueness: exactly one of the three submission kinds.
fn origin_from_submission(submission: &SubmitRequest) -> Result<Origin, SubmitError> {
    let mut origins = Vec::new();

    if let Some(series_id) = submission.patchwork_series_id {
        origins.push(Origin::Series(series_id));
    }
    if let Some(patches) = &submission.patches {
        if !patches.is_empty() {
            origins.push(Origin::Patches(patches.clone()));
        }
    }
    if let Some(hash) = &submission.hash {
        if !hash.is_empty() {
            origins.push(Origin::Hash(hash.clone()));
        }
    }

    match origins.len() {
        1 => Ok(origins.remove(0)),
        _ => Err(SubmitError::OriginConflict),
    }
}
