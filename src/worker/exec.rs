//! Script execution in a task's working directory.
//!
//! The script runs under `sh -c` with the working directory as its cwd and
//! stdin closed. Output is captured and truncated for the operational log.
//! The child is killed if the run times out or the agent is torn down.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::error::ExecError;

/// Maximum captured output per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Result of a finished script run.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs task scripts with a timeout.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(script: &str) -> Command {
        if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", script]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", script]);
            c
        }
    }

    /// Run `script` inside `workdir`. A non-zero exit is not an error.
    pub async fn run(&self, script: &str, workdir: &Path) -> Result<ScriptOutput, ExecError> {
        let mut command = Self::command(script);
        command
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let child = command.spawn().map_err(ExecError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))?
            .map_err(ExecError::Wait)?;

        Ok(ScriptOutput {
            exit_code: output.status.code(),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
            duration: start.elapsed(),
        })
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), "a b c\n").unwrap();
        let runner = ScriptRunner::new(Duration::from_secs(10));

        let output = runner
            .run("wc -w < in.txt > out.txt && cat out.txt", dir.path())
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "3");
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptRunner::new(Duration::from_secs(10));
        let output = runner.run("echo oops >&2; exit 3", dir.path()).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn multi_line_scripts() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptRunner::new(Duration::from_secs(10));
        let output = runner
            .run("x=4\ny=5\necho $((x + y))", dir.path())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "9");
    }

    #[tokio::test]
    async fn timeout_kills_the_script() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptRunner::new(Duration::from_millis(100));
        let result = runner.run("sleep 10", dir.path()).await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));
    }

    #[tokio::test]
    async fn missing_workdir_fails_to_spawn() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptRunner::new(Duration::from_secs(1));
        let result = runner.run("true", &dir.path().join("gone")).await;
        assert!(matches!(result, Err(ExecError::Spawn(_))));
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated"));
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
