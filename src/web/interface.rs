//! Wire types for the HTTP API. Everything here is plain JSON.

use serde::{Deserialize, Serialize};

use crate::storage::{ReviewStatus, StatusCounts};

/// Body of `POST /api/review`. Exactly one of `patchwork_series_id`,
/// `patches`, `hash` must be provided; the service enforces it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub token: Option<String>,
    pub tree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchwork_series_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub review_id: String,
}

/// Full review record returned by `GET /api/review`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewDetails {
    pub review_id: String,
    pub tree: String,
    pub status: ReviewStatus,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchwork_series_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(rename = "start-llm", default, skip_serializing_if = "Option::is_none")]
    pub start_llm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_patches: Option<usize>,
    /// Patches ahead of this review in the request queue; only while queued.
    #[serde(rename = "queue-len", default, skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<usize>,
    /// Per-patch artifact bodies in patch-number order, `null` where the
    /// artifact is absent. Only with `format=` on a finished review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<Vec<Option<String>>>,
}

/// One row of `GET /api/reviews`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review_id: String,
    pub status: ReviewStatus,
    pub date: String,
    pub tree: String,
    pub patch_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub reviews: Vec<ReviewSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub service: String,
    pub status: String,
    pub queue_size: usize,
    pub max_work_trees: usize,
    pub max_claude_runs: usize,
    pub review_counts: StatusCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> ErrorResponse {
        ErrorResponse {
            error: error.into(),
        }
    }
}
