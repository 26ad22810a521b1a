//! Spawns and owns the two worker pools.
//!
//! Setup workers are pinned 1:1 to work trees; LLM workers are uncoupled.
//! Threads are named so log lines carry the worker identity, and the
//! handles join on drop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;

use crate::{
    config::Config,
    llm_worker::LlmWorker,
    patchwork::SeriesSource,
    queue::ReviewQueue,
    setup_worker::SetupWorker,
    snapshot_queue::SnapshotQueue,
    storage::ReviewStorage,
    worktree::WorktreeManager,
};

pub struct WorkerPool {
    running: Arc<AtomicBool>,
    snapshots: Arc<SnapshotQueue>,

    /// Join-on-drop handles; dropping the pool blocks until every worker
    /// has observed the cleared run flag and exited its loop.
    #[allow(unused)]
    threads: Vec<jod_thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        config: Arc<Config>,
        storage: Arc<ReviewStorage>,
        queue: Arc<ReviewQueue>,
        snapshots: Arc<SnapshotQueue>,
        worktrees: Arc<WorktreeManager>,
        tracker: Option<Arc<dyn SeriesSource>>,
    ) -> anyhow::Result<WorkerPool> {
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        for tree_id in 1..=config.max_work_trees {
            let worker = SetupWorker::new(
                Arc::clone(&config),
                Arc::clone(&worktrees),
                Arc::clone(&storage),
                Arc::clone(&snapshots),
                tracker.clone(),
                tree_id,
            );
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);

            let handle = jod_thread::Builder::new()
                .name(format!("setup-{tree_id}"))
                .spawn(move || worker.run(&queue, &running))
                .context("Failed to spawn setup worker")?;
            threads.push(handle);
        }

        for worker_id in 1..=config.max_review_runs {
            let worker = LlmWorker::new(
                Arc::clone(&config),
                Arc::clone(&worktrees),
                Arc::clone(&storage),
            );
            let snapshots = Arc::clone(&snapshots);
            let running = Arc::clone(&running);

            let handle = jod_thread::Builder::new()
                .name(format!("llm-{worker_id}"))
                .spawn(move || worker.run(&snapshots, &running))
                .context("Failed to spawn LLM worker")?;
            threads.push(handle);
        }

        log::info!(
            "Worker pool started: {} setup worker(s), {} LLM worker(s)",
            config.max_work_trees,
            config.max_review_runs
        );

        Ok(WorkerPool {
            running,
            snapshots,
            threads,
        })
    }

    /// Signals every worker to finish its current item and exit. A setup
    /// worker blocked on a full snapshot queue is released by the close.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.snapshots.close();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
