//! Service configuration, loaded from a JSON5 file.
//!
//! Durations are human-readable strings ("800s", "10m") parsed with
//! humantime. Worker-pool sizes default to a fraction of the machine's
//! core count so a bare config works on both laptops and build servers.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};

use crate::json;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the shared git repository that all work trees derive from.
    pub git_tree: PathBuf,

    /// Base directory for metadata, the queue file, and review artifacts.
    pub results_path: PathBuf,

    /// Path to the JSON5 token database.
    pub token_db: PathBuf,

    /// Number of work trees, and therefore setup workers (pinned 1:1).
    #[serde(default = "default_pool_size")]
    pub max_work_trees: usize,

    /// Number of concurrent reviewer invocations (LLM workers).
    #[serde(default = "default_pool_size")]
    pub max_review_runs: usize,

    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote URL template; `{tree}` is replaced with the requested tree
    /// nickname when a remote is added.
    #[serde(default = "default_remote_url_template")]
    pub remote_url_template: String,

    /// Optional semantic indexer run over the commit range during setup.
    #[serde(default)]
    pub indexer: Option<IndexerConfig>,

    pub reviewer: ReviewerConfig,

    /// Optional patch tracker; series submissions fail without it.
    #[serde(default)]
    pub patchwork: Option<PatchworkConfig>,

    /// Debug flag: keep work-tree snapshots after review instead of
    /// deleting them.
    #[serde(default)]
    pub keep_snapshots: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    #[serde(default = "default_indexer_command")]
    pub command: String,

    #[serde(default = "default_indexer_timeout", deserialize_with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerConfig {
    /// Program invoked for each review. Tests substitute a stub script.
    #[serde(default = "default_reviewer_command")]
    pub command: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Directory copied into each snapshot before the reviewer runs.
    pub prompt_dir: PathBuf,

    /// Prompt file within `prompt_dir`, referenced from the reviewer's
    /// prompt argument.
    pub prompt_file: String,

    #[serde(default)]
    pub mcp_config: Option<PathBuf>,

    #[serde(default)]
    pub mcp_tools: Option<String>,

    /// Wall-clock limit for one reviewer attempt.
    #[serde(default = "default_review_timeout", deserialize_with = "duration_str")]
    pub timeout: Duration,

    /// Attempts per patch before the slot is marked failed.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchworkConfig {
    pub url: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = fs_err::read(path)?;
        json::from_slice_with_context(&contents, || path.display().to_string())
    }
}

fn duration_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn default_pool_size() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}

fn default_bind_address() -> IpAddr {
    Ipv4Addr::UNSPECIFIED.into()
}

fn default_port() -> u16 {
    5000
}

fn default_remote_url_template() -> String {
    "https://git.kernel.org/pub/scm/linux/kernel/git/{tree}.git".to_string()
}

fn default_indexer_command() -> String {
    "semcode-index".to_string()
}

fn default_indexer_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_reviewer_command() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_review_timeout() -> Duration {
    Duration::from_secs(800)
}

fn default_attempts() -> u32 {
    3
}
