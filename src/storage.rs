//! Review metadata and artifact storage.
//!
//! `metadata.json` is the single source of truth for review state. Every
//! mutation happens under one storage-wide lock and re-reads the file
//! first: setup workers, LLM workers, and API handlers (and cooperating
//! processes such as an uploader) all write concurrently, so in-memory
//! state alone is never authoritative.
//!
//! Artifacts live next to the metadata:
//!
//! ```text
//! <root>/metadata.json
//! <root>/queue.json
//! <root>/<token>/<review_id>/message
//! <root>/<token>/<review_id>/<patch_num>/patch
//! <root>/<token>/<review_id>/<patch_num>/review.json
//! <root>/<token>/<review_id>/<patch_num>/review.md
//! <root>/<token>/<review_id>/<patch_num>/review-inline.txt
//! ```

use std::{
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::queue::Origin;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReviewStatus {
    Queued,
    InProgress,
    Done,
    Error,
}

impl ReviewStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReviewStatus::Done | ReviewStatus::Error)
    }
}

/// Requested artifact rendition for `GET /api/review?format=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewFormat {
    Json,
    Markup,
    Inline,
}

impl ReviewFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            ReviewFormat::Json => "review.json",
            ReviewFormat::Markup => "review.md",
            ReviewFormat::Inline => "review-inline.txt",
        }
    }
}

impl FromStr for ReviewFormat {
    type Err = ();

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "json" => Ok(ReviewFormat::Json),
            "markup" => Ok(ReviewFormat::Markup),
            "inline" => Ok(ReviewFormat::Inline),
            _ => Err(()),
        }
    }
}

/// One review's metadata record, as persisted in `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub token: String,
    pub status: ReviewStatus,
    /// Creation time, RFC 3339. Also the list sort key.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(rename = "start-llm", default, skip_serializing_if = "Option::is_none")]
    pub start_llm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    pub tree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchwork_series_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub patch_count: usize,
    #[serde(default)]
    pub completed_patches: usize,
    #[serde(default)]
    pub failed_patches: usize,
}

/// Review counts by status, reported by `GET /api/status`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    #[serde(rename = "in-progress")]
    pub in_progress: usize,
    pub done: usize,
    pub error: usize,
}

type MetadataMap = IndexMap<String, ReviewRecord>;

pub struct ReviewStorage {
    root: PathBuf,
    metadata_path: PathBuf,
    lock: Mutex<()>,
}

impl ReviewStorage {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<ReviewStorage> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;
        let metadata_path = root.join("metadata.json");
        Ok(ReviewStorage {
            root,
            metadata_path,
            lock: Mutex::new(()),
        })
    }

    /// The request queue shares the storage root.
    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    /// Creates a new review record in `queued` state and its directory.
    pub fn create(
        &self,
        token: &str,
        tree: &str,
        branch: Option<&str>,
        origin: &Origin,
    ) -> anyhow::Result<String> {
        let review_id = Uuid::new_v4().to_string();

        let (hash, patchwork_series_id) = match origin {
            Origin::Hash(hash) => (Some(hash.clone()), None),
            Origin::Series(series_id) => (None, Some(*series_id)),
            Origin::Patches(_) => (None, None),
        };

        let record = ReviewRecord {
            id: review_id.clone(),
            token: token.to_string(),
            status: ReviewStatus::Queued,
            date: now_timestamp(),
            start: None,
            start_llm: None,
            end: None,
            tree: tree.to_string(),
            branch: branch.map(str::to_string),
            patchwork_series_id,
            hash,
            message: None,
            patch_count: 0,
            completed_patches: 0,
            failed_patches: 0,
        };

        self.mutate(|reviews| {
            reviews.insert(review_id.clone(), record);
        })?;

        fs_err::create_dir_all(self.review_dir(token, &review_id))?;

        Ok(review_id)
    }

    /// Updates status; stamps `start` on the first transition to
    /// in-progress and `end` on the first terminal transition.
    pub fn set_status(
        &self,
        review_id: &str,
        status: ReviewStatus,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.mutate(|reviews| {
            let Some(record) = reviews.get_mut(review_id) else {
                return;
            };
            record.status = status;
            if status == ReviewStatus::InProgress && record.start.is_none() {
                record.start = Some(now_timestamp());
            }
            if status.is_terminal() && record.end.is_none() {
                record.end = Some(now_timestamp());
            }
            if let Some(message) = message {
                record.message = Some(message.to_string());
            }
        })
    }

    pub fn set_patch_count(&self, review_id: &str, count: usize) -> anyhow::Result<()> {
        self.mutate(|reviews| {
            if let Some(record) = reviews.get_mut(review_id) {
                record.patch_count = count;
            }
        })
    }

    /// Stamps the LLM start time; only the first call has any effect.
    pub fn set_llm_start_time(&self, review_id: &str) -> anyhow::Result<()> {
        self.mutate(|reviews| {
            if let Some(record) = reviews.get_mut(review_id) {
                if record.start_llm.is_none() {
                    record.start_llm = Some(now_timestamp());
                }
            }
        })
    }

    /// Records one slot's completion and, when the last slot lands, drives
    /// the review to its terminal state: `done` when nothing failed,
    /// `error` with a summary message otherwise.
    pub fn mark_patch_complete(
        &self,
        review_id: &str,
        patch_num: usize,
        success: bool,
    ) -> anyhow::Result<()> {
        log::debug!("Marking patch {patch_num} of review {review_id} complete (success={success})");

        self.mutate(|reviews| {
            let Some(record) = reviews.get_mut(review_id) else {
                return;
            };

            record.completed_patches += 1;
            if !success {
                record.failed_patches += 1;
            }

            let total = record.patch_count;
            if total > 0 && record.completed_patches >= total {
                if record.failed_patches > 0 {
                    record.status = ReviewStatus::Error;
                    if record.message.is_none() {
                        record.message = Some(format!(
                            "{} of {} patches failed review",
                            record.failed_patches, total
                        ));
                    }
                } else {
                    record.status = ReviewStatus::Done;
                }
                if record.end.is_none() {
                    record.end = Some(now_timestamp());
                }
            }
        })
    }

    pub fn get(&self, review_id: &str) -> anyhow::Result<Option<ReviewRecord>> {
        let _guard = self.lock.lock().unwrap();
        let reviews = self.load()?;
        Ok(reviews.get(review_id).cloned())
    }

    /// Recent reviews, newest first. `all_tokens` drops the owner filter
    /// (superuser listing).
    pub fn list(
        &self,
        token: &str,
        limit: usize,
        all_tokens: bool,
    ) -> anyhow::Result<Vec<ReviewRecord>> {
        let _guard = self.lock.lock().unwrap();
        let reviews = self.load()?;

        let mut records: Vec<ReviewRecord> = reviews
            .values()
            .filter(|record| all_tokens || record.token == token)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.date.cmp(&a.date));
        records.truncate(limit);
        Ok(records)
    }

    pub fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        let _guard = self.lock.lock().unwrap();
        let reviews = self.load()?;

        let mut counts = StatusCounts::default();
        for record in reviews.values() {
            match record.status {
                ReviewStatus::Queued => counts.queued += 1,
                ReviewStatus::InProgress => counts.in_progress += 1,
                ReviewStatus::Done => counts.done += 1,
                ReviewStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }

    pub fn review_dir(&self, token: &str, review_id: &str) -> PathBuf {
        self.root.join(token).join(review_id)
    }

    pub fn patch_dir(&self, token: &str, review_id: &str, patch_num: usize) -> PathBuf {
        self.review_dir(token, review_id).join(patch_num.to_string())
    }

    pub fn write_message(&self, token: &str, review_id: &str, message: &str) -> anyhow::Result<()> {
        let dir = self.review_dir(token, review_id);
        fs_err::create_dir_all(&dir)?;
        fs_err::write(dir.join("message"), message)?;
        Ok(())
    }

    pub fn read_message(&self, token: &str, review_id: &str) -> Option<String> {
        read_optional(&self.review_dir(token, review_id).join("message"))
    }

    pub fn write_patch_file(
        &self,
        token: &str,
        review_id: &str,
        patch_num: usize,
        content: &str,
    ) -> anyhow::Result<()> {
        let dir = self.patch_dir(token, review_id, patch_num);
        fs_err::create_dir_all(&dir)?;
        fs_err::write(dir.join("patch"), content)?;
        Ok(())
    }

    /// Reads one patch's artifact in the requested rendition; `None` when
    /// the file was never produced.
    pub fn read_review_file(
        &self,
        token: &str,
        review_id: &str,
        patch_num: usize,
        format: ReviewFormat,
    ) -> Option<String> {
        read_optional(
            &self
                .patch_dir(token, review_id, patch_num)
                .join(format.file_name()),
        )
    }

    fn mutate(&self, f: impl FnOnce(&mut MetadataMap)) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut reviews = self.load()?;
        f(&mut reviews);
        self.save(&reviews)
    }

    fn load(&self) -> anyhow::Result<MetadataMap> {
        match fs_err::read(&self.metadata_path) {
            Ok(contents) => serde_json::from_slice(&contents)
                .with_context(|| format!("{} is corrupt", self.metadata_path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MetadataMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, reviews: &MetadataMap) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(reviews)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        io::Write::write_all(&mut temp, &contents)?;
        temp.persist(&self.metadata_path)?;
        Ok(())
    }
}

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("RFC 3339 formatting of a UTC timestamp cannot fail")
}

fn read_optional(path: &Path) -> Option<String> {
    match fs_err::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            log::warn!("Failed to read {}: {e}", path.display());
            None
        }
    }
}
