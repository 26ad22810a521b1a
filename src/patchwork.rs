//! Patch-tracker client. The pipeline only needs two things from a tracker:
//! how many patches a series has (for queue-position estimates) and the
//! series as a single mailbox (for `git am`).

use serde::Deserialize;

pub trait SeriesSource: Send + Sync {
    /// Number of patches in the series.
    fn series_patch_count(&self, series_id: u64) -> anyhow::Result<usize>;

    /// The whole series as one mbox; applying it may create several commits.
    fn series_mbox(&self, series_id: u64) -> anyhow::Result<String>;
}

/// Client for the Patchwork REST API.
pub struct PatchworkClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SeriesDetail {
    #[serde(default)]
    patches: Vec<serde_json::Value>,
}

impl PatchworkClient {
    pub fn new(base_url: impl Into<String>) -> PatchworkClient {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        PatchworkClient {
            client: reqwest::blocking::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl SeriesSource for PatchworkClient {
    fn series_patch_count(&self, series_id: u64) -> anyhow::Result<usize> {
        let url = format!("{}/api/1.2/series/{}/", self.base_url, series_id);
        let detail: SeriesDetail = self
            .client
            .get(&url)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(detail.patches.len())
    }

    fn series_mbox(&self, series_id: u64) -> anyhow::Result<String> {
        let url = format!("{}/api/1.2/series/{}/mbox/", self.base_url, series_id);
        let mbox = self.client.get(&url).send()?.error_for_status()?.text()?;
        Ok(mbox)
    }
}
