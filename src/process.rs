//! Subprocess execution with a hard wall-clock timeout.
//!
//! The external commands the pipeline runs (the reviewer, the indexer) can
//! wedge; each invocation gets a deadline, and on expiry the child's whole
//! process group is killed so grandchildren don't linger.

use std::{
    io::{self, Read},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct ExecOutcome {
    pub timed_out: bool,
    /// Exit status; `None` when the child was killed on timeout.
    pub status: Option<ExitStatus>,
    pub stderr: Vec<u8>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs `cmd` to completion or until `timeout` elapses.
///
/// stdin is closed and stderr is captured; the caller may configure stdout
/// beforehand (for example, redirected into an artifact file). On Unix the
/// child is placed in its own process group and the entire group is killed
/// on timeout.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<ExecOutcome> {
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            buffer
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    kill_group(&mut child);
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    Ok(ExecOutcome {
        timed_out: status.is_none(),
        status,
        stderr,
    })
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pgid = child.id() as i32;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    // In case the group kill raced with the child's exit.
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}
