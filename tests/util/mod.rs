//! Shared fixtures for the end-to-end tests: tempdir git repositories, a
//! stub reviewer script, and a fully wired [`Service`].

use std::{
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, Instant},
};

use librevue::{Config, ReviewRecord, ReviewerConfig, Service};

pub const TOKEN: &str = "test-token";

/// Stub reviewer: reports the snapshot's `marker.txt`, which identifies the
/// commit the snapshot was pinned to.
pub const MARKER_REVIEWER: &str = r#"marker=$(cat marker.txt 2>/dev/null || echo none)
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"reviewed %s"}]}}\n' "$marker"
"#;

pub struct TestHarness {
    /// Owns every fixture path below; dropped last.
    pub _root: tempfile::TempDir,
    pub upstream: PathBuf,
    pub shared: PathBuf,
    pub tree: String,
    pub branch: String,
    pub config: Config,
    reviewer_script: PathBuf,
}

impl TestHarness {
    pub fn new() -> TestHarness {
        let root = tempfile::tempdir().unwrap();

        let tree = "foo".to_string();
        let upstream = root.path().join("remotes").join(&tree);
        fs::create_dir_all(&upstream).unwrap();
        init_repo(&upstream);
        commit_marker(&upstream, "base", "base commit");
        let branch = current_branch(&upstream);

        // The shared repository the work trees are carved out of.
        let shared = root.path().join("shared");
        let output = Command::new("git")
            .arg("clone")
            .arg(&upstream)
            .arg(&shared)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        configure_user(&shared);

        let prompt_dir = root.path().join("prompts");
        fs::create_dir_all(&prompt_dir).unwrap();
        fs::write(prompt_dir.join("review-prompt.md"), "Review this patch.").unwrap();

        let reviewer_script = root.path().join("fake-reviewer.sh");
        write_script(&reviewer_script, MARKER_REVIEWER);

        let config = Config {
            git_tree: shared.clone(),
            results_path: root.path().join("results"),
            token_db: root.path().join("tokens.json5"),
            max_work_trees: 1,
            max_review_runs: 1,
            bind_address: Ipv4Addr::LOCALHOST.into(),
            port: 0,
            remote_url_template: format!("{}/remotes/{{tree}}", root.path().display()),
            indexer: None,
            reviewer: ReviewerConfig {
                command: reviewer_script.to_string_lossy().into_owned(),
                model: "sonnet".to_string(),
                prompt_dir,
                prompt_file: "review-prompt.md".to_string(),
                mcp_config: None,
                mcp_tools: None,
                timeout: Duration::from_secs(30),
                attempts: 1,
            },
            patchwork: None,
            keep_snapshots: false,
        };

        TestHarness {
            _root: root,
            upstream,
            shared,
            tree,
            branch,
            config,
            reviewer_script,
        }
    }

    pub fn service(&self) -> Service {
        Service::new(self.config.clone()).unwrap()
    }

    pub fn set_reviewer_script(&self, body: &str) {
        write_script(&self.reviewer_script, body);
    }

    /// Commits a new `marker.txt` to the upstream repository and returns
    /// the commit hash.
    pub fn upstream_commit(&self, marker: &str, message: &str) -> String {
        commit_marker(&self.upstream, marker, message)
    }

    /// Commits on a side branch and returns the `git format-patch` text,
    /// leaving the default branch untouched.
    pub fn upstream_patch(&self, branch: &str, marker: &str, message: &str) -> String {
        let head = current_branch(&self.upstream);
        if head != branch {
            let create = !branch_exists(&self.upstream, branch);
            let mut args = vec!["checkout"];
            if create {
                args.push("-b");
            }
            args.push(branch);
            git(&self.upstream, &args);
        }

        commit_marker(&self.upstream, marker, message);

        let output = Command::new("git")
            .args(["format-patch", "-1", "HEAD", "--stdout"])
            .current_dir(&self.upstream)
            .output()
            .unwrap();
        assert!(output.status.success());
        let patch = String::from_utf8(output.stdout).unwrap();

        git(&self.upstream, &["checkout", &self.branch]);
        patch
    }

    /// Polls until the review reaches a terminal state.
    pub fn wait_terminal(&self, service: &Service, review_id: &str) -> ReviewRecord {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            let record = service
                .storage()
                .get(review_id)
                .unwrap()
                .expect("review record should exist");
            if record.status.is_terminal() {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "review did not finish in time: {record:?}"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn patch_dir(&self, service: &Service, review_id: &str, patch_num: usize) -> PathBuf {
        service.storage().patch_dir(TOKEN, review_id, patch_num)
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(dir: &Path) {
    git(dir, &["init"]);
    configure_user(dir);
}

fn configure_user(dir: &Path) {
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@test.com"]);
}

fn commit_marker(dir: &Path, marker: &str, message: &str) -> String {
    fs::write(dir.join("marker.txt"), marker).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);

    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn current_branch(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["branch", "--show-current"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn branch_exists(dir: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(dir)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }
}
