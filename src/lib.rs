pub mod cli;
pub mod logging;

mod auth;
mod config;
mod json;
mod llm_worker;
mod patchwork;
mod process;
mod queue;
mod review_stream;
mod service;
mod setup_worker;
mod snapshot_queue;
mod storage;
mod web;
mod worker_pool;
mod worktree;

pub use auth::{TokenAuth, TokenInfo};
pub use config::{Config, IndexerConfig, PatchworkConfig, ReviewerConfig};
pub use patchwork::{PatchworkClient, SeriesSource};
pub use queue::{Origin, ReviewQueue, ReviewRequest};
pub use review_stream::extract_review_text;
pub use service::{Service, SubmitError};
pub use snapshot_queue::{Snapshot, SnapshotQueue};
pub use storage::{ReviewFormat, ReviewRecord, ReviewStatus, ReviewStorage, StatusCounts};
pub use web::interface as web_api;
pub use web::LiveServer;
pub use worktree::WorktreeManager;
