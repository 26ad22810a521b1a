//! LLM workers: consume snapshots, run the external review command, and
//! persist whatever came out of it.
//!
//! Every attempt leaves a trail: stdout streams straight into
//! `review.json`, failures save stderr/timeout/error context per attempt,
//! and partial output is preserved so a flaky run is still inspectable.

use std::{
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    config::Config,
    process,
    review_stream,
    snapshot_queue::{Snapshot, SnapshotQueue},
    storage::ReviewStorage,
    worktree::{self, WorktreeManager},
};

pub struct LlmWorker {
    config: Arc<Config>,
    worktrees: Arc<WorktreeManager>,
    storage: Arc<ReviewStorage>,
}

impl LlmWorker {
    pub fn new(
        config: Arc<Config>,
        worktrees: Arc<WorktreeManager>,
        storage: Arc<ReviewStorage>,
    ) -> LlmWorker {
        LlmWorker {
            config,
            worktrees,
            storage,
        }
    }

    /// Worker loop. Each received snapshot is processed to a terminal
    /// outcome and cleaned up on every exit path.
    pub fn run(&self, snapshots: &SnapshotQueue, running: &AtomicBool) {
        log::info!("LLM worker started");

        while running.load(Ordering::Relaxed) {
            let Some(snapshot) = snapshots.get(Duration::from_secs(1)) else {
                continue;
            };

            log::info!(
                "Reviewing patch {} of review {}",
                snapshot.patch_num,
                snapshot.review_id
            );

            let success = self.process_snapshot(&snapshot);

            if let Err(e) =
                self.storage
                    .mark_patch_complete(&snapshot.review_id, snapshot.patch_num, success)
            {
                log::error!("Failed to record patch completion: {e}");
            }

            if self.config.keep_snapshots {
                log::info!("Keeping snapshot {} (debug)", snapshot.path.display());
            } else {
                self.worktrees.remove_snapshot(&snapshot.path);
            }

            snapshots.task_done();
        }
    }

    /// Runs the reviewer with retries; `true` when some attempt succeeded.
    fn process_snapshot(&self, snapshot: &Snapshot) -> bool {
        let attempts = self.config.reviewer.attempts.max(1);
        let short_hash = snapshot.commit_hash.get(..8).unwrap_or(&snapshot.commit_hash);

        for attempt in 1..=attempts {
            log::info!("Review attempt {attempt} for commit {short_hash}");

            if self.run_review_attempt(snapshot, attempt) {
                log::info!(
                    "Reviewed patch {} of review {}",
                    snapshot.patch_num,
                    snapshot.review_id
                );
                return true;
            }

            log::warn!("Review attempt {attempt} failed for commit {short_hash}");
        }

        log::warn!("Review failed after {attempts} attempt(s) for commit {short_hash}");
        false
    }

    fn run_review_attempt(&self, snapshot: &Snapshot, attempt: u32) -> bool {
        let reviewer = &self.config.reviewer;
        let patch_dir = self
            .storage
            .patch_dir(&snapshot.token, &snapshot.review_id, snapshot.patch_num);

        if let Err(e) = fs_err::create_dir_all(&patch_dir) {
            log::error!("Failed to create {}: {e}", patch_dir.display());
            return false;
        }

        // Stage the prompt directory inside the snapshot, replacing any
        // copy left behind by a previous attempt.
        let prompt_name = reviewer
            .prompt_dir
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "prompts".into());
        let staged_prompt_dir = snapshot.path.join(&prompt_name);
        if staged_prompt_dir.exists() {
            if let Err(e) = fs_err::remove_dir_all(&staged_prompt_dir) {
                log::warn!("Failed to clear stale prompt copy: {e}");
            }
        }
        if let Err(e) = worktree::copy_tree(&reviewer.prompt_dir, &staged_prompt_dir) {
            log::error!(
                "Failed to copy prompt directory into {}: {e}",
                snapshot.path.display()
            );
            self.write_error_file(&patch_dir, attempt, &e.to_string());
            return false;
        }

        let prompt_path = staged_prompt_dir.join(&reviewer.prompt_file);
        if !prompt_path.exists() {
            log::warn!("Prompt file not found at {}", prompt_path.display());
        }

        let mut cmd = Command::new(&reviewer.command);
        if let Some(mcp_config) = &reviewer.mcp_config {
            cmd.arg("--mcp-config").arg(mcp_config).arg("--strict-mcp-config");
        }
        if let Some(tools) = &reviewer.mcp_tools {
            cmd.arg("--allowedTools").arg(tools);
        }
        cmd.arg("--model").arg(&reviewer.model);
        cmd.arg("-p").arg(format!(
            "review the top commit in this directory using prompt {}",
            prompt_path.display()
        ));
        cmd.arg("--verbose").arg("--output-format=stream-json");
        cmd.current_dir(&snapshot.path);

        let review_json_path = patch_dir.join("review.json");
        let json_file = match fs_err::File::create(&review_json_path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Failed to create {}: {e}", review_json_path.display());
                self.write_error_file(&patch_dir, attempt, &e.to_string());
                return false;
            }
        };
        cmd.stdout(Stdio::from(json_file.into_parts().0));

        if attempt == 1 && snapshot.patch_num == 1 {
            if let Err(e) = self.storage.set_llm_start_time(&snapshot.review_id) {
                log::error!("Failed to record LLM start time: {e}");
            }
        }

        log::debug!(
            "Reviewer cwd {} prompt {}",
            snapshot.path.display(),
            prompt_path.display()
        );

        let started = Instant::now();
        let outcome = match process::run_with_timeout(&mut cmd, reviewer.timeout) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Failed to run reviewer: {e}");
                self.write_error_file(&patch_dir, attempt, &e.to_string());
                return false;
            }
        };
        let elapsed = started.elapsed();

        if outcome.timed_out {
            log::warn!(
                "Review timed out for {} patch {} after {} (attempt {attempt})",
                snapshot.review_id,
                snapshot.patch_num,
                humantime::format_duration(reviewer.timeout)
            );
            self.write_timeout_file(&patch_dir, attempt, &cmd, snapshot, &outcome);
            self.save_partial_output(&patch_dir, &review_json_path, attempt);
            return false;
        }

        let status = outcome
            .status
            .expect("exit status is present when the child did not time out");

        if !status.success() {
            log::warn!(
                "Review failed for {} patch {} after {:.1}s: {}",
                snapshot.review_id,
                snapshot.patch_num,
                elapsed.as_secs_f64(),
                outcome.stderr_lossy()
            );
            let stderr_path = patch_dir.join(format!("claude-stderr-attempt{attempt}.txt"));
            if let Err(e) = fs_err::write(&stderr_path, &outcome.stderr) {
                log::warn!("Failed to save stderr: {e}");
            }
            self.save_partial_output(&patch_dir, &review_json_path, attempt);
            return false;
        }

        log::info!(
            "Review completed for {} patch {} in {:.1}s",
            snapshot.review_id,
            snapshot.patch_num,
            elapsed.as_secs_f64()
        );

        // The reviewer sometimes drops an inline-comments file next to the
        // prompt; pick it up when present, absence is fine.
        let inline_src = snapshot.path.join("review-inline.txt");
        if inline_src.exists() {
            if let Err(e) = fs_err::copy(&inline_src, patch_dir.join("review-inline.txt")) {
                log::warn!("Failed to copy review-inline.txt: {e}");
            }
        }

        match review_stream::convert_json_to_markdown(&review_json_path, &patch_dir.join("review.md"))
        {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to convert review to markdown: {e}");
                false
            }
        }
    }

    /// Saves whatever made it into `review.json` before a failed attempt,
    /// plus a best-effort markdown rendition.
    fn save_partial_output(
        &self,
        patch_dir: &std::path::Path,
        review_json_path: &std::path::Path,
        attempt: u32,
    ) {
        let has_content = std::fs::metadata(review_json_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !has_content {
            return;
        }

        let partial_json = patch_dir.join(format!("review-partial-attempt{attempt}.json"));
        match fs_err::copy(review_json_path, &partial_json) {
            Ok(_) => log::info!("Partial output saved to {}", partial_json.display()),
            Err(e) => {
                log::warn!("Failed to save partial output: {e}");
                return;
            }
        }

        let partial_md = patch_dir.join(format!("review-partial-attempt{attempt}.md"));
        let _ = review_stream::convert_json_to_markdown(review_json_path, &partial_md);
    }

    fn write_timeout_file(
        &self,
        patch_dir: &std::path::Path,
        attempt: u32,
        cmd: &Command,
        snapshot: &Snapshot,
        outcome: &process::ExecOutcome,
    ) {
        let mut info = format!(
            "Attempt: {attempt}\nReview command timed out after {}\nCommand: {cmd:?}\nWorking directory: {}\n",
            humantime::format_duration(self.config.reviewer.timeout),
            snapshot.path.display()
        );
        if !outcome.stderr.is_empty() {
            info.push_str("\nStderr output:\n");
            info.push_str(&outcome.stderr_lossy());
            info.push('\n');
        }

        let path = patch_dir.join(format!("timeout-info-attempt{attempt}.txt"));
        if let Err(e) = fs_err::write(&path, info) {
            log::warn!("Failed to save timeout info: {e}");
        }
    }

    fn write_error_file(&self, patch_dir: &std::path::Path, attempt: u32, error: &str) {
        let path = patch_dir.join(format!("error-attempt{attempt}.txt"));
        let contents = format!("Attempt: {attempt}\nError: {error}\n");
        if let Err(e) = fs_err::write(&path, contents) {
            log::warn!("Failed to save error info: {e}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{Config, ReviewerConfig};
    use crate::storage::ReviewStorage;
    use std::net::Ipv4Addr;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    struct Fixture {
        _dir: tempfile::TempDir,
        worker: LlmWorker,
        storage: Arc<ReviewStorage>,
        snapshot: Snapshot,
        token: String,
        review_id: String,
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn config(dir: &Path, reviewer_script: PathBuf, timeout: Duration, attempts: u32) -> Config {
        let prompt_dir = dir.join("prompts");
        std::fs::create_dir_all(&prompt_dir).unwrap();
        std::fs::write(prompt_dir.join("review-prompt.md"), "Review this patch.").unwrap();

        Config {
            git_tree: dir.join("repo"),
            results_path: dir.join("results"),
            token_db: dir.join("tokens.json5"),
            max_work_trees: 1,
            max_review_runs: 1,
            bind_address: Ipv4Addr::LOCALHOST.into(),
            port: 0,
            remote_url_template: "{tree}".to_string(),
            indexer: None,
            reviewer: ReviewerConfig {
                command: reviewer_script.to_string_lossy().into_owned(),
                model: "sonnet".to_string(),
                prompt_dir,
                prompt_file: "review-prompt.md".to_string(),
                mcp_config: None,
                mcp_tools: None,
                timeout,
                attempts,
            },
            patchwork: None,
            keep_snapshots: false,
        }
    }

    fn fixture(script_body: &str, timeout: Duration, attempts: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        // WorktreeManager needs a git repo to probe, but zero trees will do
        // for attempt-level tests.
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = |args: &[&str]| {
            let output = std::process::Command::new("git")
                .args(args)
                .current_dir(&repo)
                .output()
                .unwrap();
            assert!(output.status.success());
        };
        git(&["init"]);

        let script = dir.path().join("fake-reviewer.sh");
        write_script(&script, script_body);

        let config = Arc::new(config(dir.path(), script, timeout, attempts));
        let storage = Arc::new(ReviewStorage::open(&config.results_path).unwrap());
        let worktrees = Arc::new(WorktreeManager::init(&repo, 0).unwrap());

        let token = "tok".to_string();
        let review_id = storage
            .create(
                &token,
                "net-next",
                None,
                &crate::queue::Origin::Hash("deadbeef".to_string()),
            )
            .unwrap();
        storage.set_patch_count(&review_id, 1).unwrap();

        let snapshot_dir = dir.path().join("snapshot");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        std::fs::write(snapshot_dir.join("code.c"), "int main(void) { return 0; }").unwrap();

        let snapshot = Snapshot {
            path: snapshot_dir,
            token: token.clone(),
            review_id: review_id.clone(),
            patch_num: 1,
            commit_hash: "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        };

        let worker = LlmWorker::new(Arc::clone(&config), worktrees, Arc::clone(&storage));

        Fixture {
            _dir: dir,
            worker,
            storage,
            snapshot,
            token,
            review_id,
        }
    }

    const ASSISTANT_LINE: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"LGTM"}]}}"#;

    #[test]
    fn successful_review_produces_json_and_markdown() {
        let f = fixture(&format!("echo '{ASSISTANT_LINE}'"), Duration::from_secs(10), 1);

        assert!(f.worker.process_snapshot(&f.snapshot));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        assert!(patch_dir.join("review.json").exists());
        assert_eq!(
            std::fs::read_to_string(patch_dir.join("review.md")).unwrap(),
            "LGTM"
        );

        // The prompt directory was staged into the snapshot.
        assert!(f.snapshot.path.join("prompts/review-prompt.md").exists());

        // The first successful attempt of patch 1 stamps the LLM start.
        let record = f.storage.get(&f.review_id).unwrap().unwrap();
        assert!(record.start_llm.is_some());
    }

    #[test]
    fn inline_comments_are_copied_when_produced() {
        let f = fixture(
            &format!("echo 'inline note' > review-inline.txt\necho '{ASSISTANT_LINE}'"),
            Duration::from_secs(10),
            1,
        );

        assert!(f.worker.process_snapshot(&f.snapshot));

        let inline = f
            .storage
            .read_review_file(&f.token, &f.review_id, 1, crate::storage::ReviewFormat::Inline)
            .unwrap();
        assert_eq!(inline, "inline note\n");
    }

    #[test]
    fn failure_saves_stderr_per_attempt() {
        let f = fixture("echo 'model exploded' >&2\nexit 1", Duration::from_secs(10), 2);

        assert!(!f.worker.process_snapshot(&f.snapshot));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        for attempt in 1..=2 {
            let stderr = std::fs::read_to_string(
                patch_dir.join(format!("claude-stderr-attempt{attempt}.txt")),
            )
            .unwrap();
            assert!(stderr.contains("model exploded"));
        }
        assert!(!patch_dir.join("review.md").exists());
    }

    #[test]
    fn partial_output_is_preserved_on_failure() {
        let f = fixture(
            &format!("echo '{ASSISTANT_LINE}'\nexit 1"),
            Duration::from_secs(10),
            1,
        );

        assert!(!f.worker.process_snapshot(&f.snapshot));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        assert!(patch_dir.join("review-partial-attempt1.json").exists());
        assert_eq!(
            std::fs::read_to_string(patch_dir.join("review-partial-attempt1.md")).unwrap(),
            "LGTM"
        );
    }

    #[test]
    fn timeout_writes_info_files_for_each_attempt() {
        let f = fixture("sleep 10", Duration::from_millis(300), 2);

        let started = Instant::now();
        assert!(!f.worker.process_snapshot(&f.snapshot));
        assert!(started.elapsed() < Duration::from_secs(8));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        for attempt in 1..=2 {
            let info = std::fs::read_to_string(
                patch_dir.join(format!("timeout-info-attempt{attempt}.txt")),
            )
            .unwrap();
            assert!(info.contains(&format!("Attempt: {attempt}")));
            assert!(info.contains("timed out"));
            assert!(info.contains("Working directory:"));
        }
    }

    #[test]
    fn missing_reviewer_binary_writes_error_file() {
        let mut f = fixture("exit 0", Duration::from_secs(5), 1);
        // Point the worker at a binary that cannot be spawned.
        let mut bad_config = (*f.worker.config).clone();
        bad_config.reviewer.command = "/nonexistent/reviewer".to_string();
        f.worker.config = Arc::new(bad_config);

        assert!(!f.worker.process_snapshot(&f.snapshot));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        let error = std::fs::read_to_string(patch_dir.join("error-attempt1.txt")).unwrap();
        assert!(error.starts_with("Attempt: 1"));
    }

    #[test]
    fn retry_succeeds_after_transient_failure() {
        // Fails on the first run, succeeds once a marker file exists.
        let f = fixture(
            &format!(
                "if [ -f attempt-marker ]; then echo '{ASSISTANT_LINE}'; else touch attempt-marker; exit 1; fi"
            ),
            Duration::from_secs(10),
            3,
        );

        assert!(f.worker.process_snapshot(&f.snapshot));

        let patch_dir = f.storage.patch_dir(&f.token, &f.review_id, 1);
        assert!(patch_dir.join("claude-stderr-attempt1.txt").exists());
        assert_eq!(
            std::fs::read_to_string(patch_dir.join("review.md")).unwrap(),
            "LGTM"
        );
    }
}
