//! Subprocess Runner
//!
//! Launches external checkers with a deadline, captures capped
//! stdout/stderr, and kills the whole process group on expiry or
//! cancellation. A spawn failure is reported as a null exit code,
//! distinct from a non-zero exit.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured outcome of one external command
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Exit code; None when the process never spawned or was killed by signal
    pub exit_code: Option<i32>,
    /// Captured stdout, truncated to the stream cap
    pub stdout: String,
    /// Captured stderr, truncated to the stream cap
    pub stderr: String,
    /// Whether the command never launched
    pub spawn_failed: bool,
    /// Whether the deadline or cancellation stopped it
    pub timed_out: bool,
    /// Wall-clock duration
    pub duration: Duration,
}

impl RunOutput {
    /// Success means spawned, finished in time, and exited zero
    pub fn success(&self) -> bool {
        !self.spawn_failed && !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs external commands under deadlines with group-wide termination
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    /// Per-stream capture cap in bytes; overflow is truncated with a marker
    stream_cap_bytes: usize,
    /// Delay between the soft signal and the hard kill
    grace: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self {
            stream_cap_bytes: 64 * 1024,
            grace: Duration::from_secs(3),
        }
    }
}

impl SubprocessRunner {
    pub fn new(stream_cap_bytes: usize, grace: Duration) -> Self {
        Self {
            stream_cap_bytes,
            grace,
        }
    }

    /// Run `argv` in `cwd` with a deadline.
    ///
    /// The child gets its own process group so descendants (e.g. test
    /// binaries spawned by a build tool) die with it. On deadline expiry or
    /// cancellation the group receives SIGTERM, then SIGKILL after the
    /// grace period. `envs` are exported into the child's environment.
    pub async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        envs: &[(String, String)],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> RunOutput {
        let start = Instant::now();
        if argv.is_empty() {
            return RunOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: "empty command".into(),
                spawn_failed: true,
                timed_out: false,
                duration: start.elapsed(),
            };
        }

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to spawn {}: {e}", argv[0]),
                    spawn_failed: true,
                    timed_out: false,
                    duration: start.elapsed(),
                };
            }
        };
        let pid = child.id();

        let output_fut = child.wait_with_output();
        tokio::pin!(output_fut);

        let (output, timed_out) = tokio::select! {
            result = &mut output_fut => (result, false),
            _ = tokio::time::sleep(deadline) => {
                warn!(cmd = %argv[0], deadline_secs = deadline.as_secs(), "Deadline expired, terminating process group");
                self.terminate_group(pid);
                // Collect whatever output survived; the kill resolves the wait
                match tokio::time::timeout(self.grace + Duration::from_secs(2), &mut output_fut).await {
                    Ok(result) => (result, true),
                    Err(_) => {
                        return RunOutput {
                            exit_code: None,
                            stdout: String::new(),
                            stderr: "process unresponsive after kill".into(),
                            spawn_failed: false,
                            timed_out: true,
                            duration: start.elapsed(),
                        };
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!(cmd = %argv[0], "Cancelled, terminating process group");
                self.terminate_group(pid);
                match tokio::time::timeout(self.grace + Duration::from_secs(2), &mut output_fut).await {
                    Ok(result) => (result, true),
                    Err(_) => {
                        return RunOutput {
                            exit_code: None,
                            stdout: String::new(),
                            stderr: "process unresponsive after kill".into(),
                            spawn_failed: false,
                            timed_out: true,
                            duration: start.elapsed(),
                        };
                    }
                }
            }
        };

        match output {
            Ok(output) => RunOutput {
                exit_code: if timed_out { None } else { output.status.code() },
                stdout: self.truncate(&output.stdout),
                stderr: self.truncate(&output.stderr),
                spawn_failed: false,
                timed_out,
                duration: start.elapsed(),
            },
            Err(e) => RunOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to collect output: {e}"),
                spawn_failed: false,
                timed_out,
                duration: start.elapsed(),
            },
        }
    }

    /// SIGTERM the group, then SIGKILL after the grace period.
    #[cfg(unix)]
    fn terminate_group(&self, pid: Option<u32>) {
        let Some(pid) = pid else { return };
        let pgid = pid as libc::pid_t;
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        });
    }

    #[cfg(not(unix))]
    fn terminate_group(&self, _pid: Option<u32>) {
        // kill_on_drop covers the non-Unix path
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        let s = String::from_utf8_lossy(bytes);
        if s.len() <= self.stream_cap_bytes {
            s.to_string()
        } else {
            let mut end = self.stream_cap_bytes;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...\n[truncated at {} bytes]", &s[..end], s.len())
        }
    }
}
