//! Shell command execution.
//!
//! Every `do` operation runs through the configured shell with the
//! workpackage's environment applied. Stdout and stderr land in capture
//! files inside the working directory (append mode), the child environment
//! is snapshotted after a successful command so later operations and
//! exporting steps observe its changes, and failures carry the last lines
//! of captured stderr.

use benchflow_core::{BenchError, Result, RunContext};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Number of stderr lines attached to execution errors.
pub const ERROR_MSG_LINES: usize = 5;

/// Name of the transient environment snapshot file.
const ENV_SNAPSHOT: &str = ".benchflow_env";

/// Outcome of a completed shell command.
#[derive(Debug)]
pub struct ShellOutcome {
    /// Exit code (0 on success).
    pub exit_code: i32,
    /// Child environment captured after the command, when it succeeded.
    pub env: Option<BTreeMap<String, String>>,
}

/// Run `command` through the context shell inside `work_dir`.
///
/// `env` replaces the child's environment entirely. Stdout/stderr are
/// appended to the given capture files. On success the child's final
/// environment is read back from a snapshot produced by appending
/// `&& env > snapshot` to the command line.
pub fn run_command(
    ctx: &RunContext,
    command: &str,
    work_dir: &Path,
    env: &BTreeMap<String, String>,
    stdout_file: &Path,
    stderr_file: &Path,
) -> Result<ShellOutcome> {
    let trimmed = command.trim().trim_matches(';');
    if trimmed.is_empty() {
        return Ok(ShellOutcome {
            exit_code: 0,
            env: None,
        });
    }

    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stdout_file)
        .map_err(|e| BenchError::io(format!("opening {}", stdout_file.display()), e))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stderr_file)
        .map_err(|e| BenchError::io(format!("opening {}", stderr_file.display()), e))?;

    let snapshot = work_dir.join(ENV_SNAPSHOT);
    let wrapped = format!("{trimmed} && env > \"{}\"", snapshot.display());
    debug!(shell = %ctx.shell, cwd = %work_dir.display(), ">>> {trimmed}");

    let status = Command::new(&ctx.shell)
        .arg("-c")
        .arg(&wrapped)
        .current_dir(work_dir)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .map_err(|e| {
            BenchError::Execution(format!(
                "failed to launch '{trimmed}' in {}: {e}",
                work_dir.display()
            ))
        })?;

    let exit_code = status.code().unwrap_or(-1);
    let captured_env = if status.success() {
        read_env_snapshot(&snapshot)
    } else {
        let _ = std::fs::remove_file(&snapshot);
        None
    };

    Ok(ShellOutcome {
        exit_code,
        env: captured_env,
    })
}

/// Read and remove the environment snapshot written by the wrapped command.
/// Multi-line values continue on lines without `=`.
fn read_env_snapshot(path: &Path) -> Option<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let _ = std::fs::remove_file(path);
    let mut env = BTreeMap::new();
    let mut last: Option<String> = None;
    for line in content.lines() {
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() && !key.contains(char::is_whitespace) => {
                env.insert(key.to_string(), value.to_string());
                last = Some(key.to_string());
            }
            _ => {
                if let Some(key) = &last {
                    let entry = env.get_mut(key).expect("continuation of known key");
                    entry.push('\n');
                    entry.push_str(line);
                }
            }
        }
    }
    Some(env)
}

/// Build the error message for a failed command: the engine's description
/// plus the last [`ERROR_MSG_LINES`] lines of the stderr capture file.
pub fn failure_message(command: &str, work_dir: &Path, stderr_file: &Path, exit_code: i32) -> String {
    let mut message = format!(
        "command '{}' failed with exit code {} in {}",
        command,
        exit_code,
        work_dir.display()
    );
    if let Ok(content) = std::fs::read_to_string(stderr_file) {
        let lines: Vec<&str> = content.lines().collect();
        if !lines.is_empty() {
            let tail_start = lines.len().saturating_sub(ERROR_MSG_LINES);
            message.push_str("\nstderr:");
            if tail_start > 0 {
                message.push_str("\n...");
            }
            for line in &lines[tail_start..] {
                message.push('\n');
                message.push_str(line);
            }
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> BTreeMap<String, String> {
        // A minimal PATH so `env` and coreutils resolve.
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        );
        env
    }

    #[test]
    fn stdout_is_captured_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        let ctx = RunContext::default();

        for _ in 0..2 {
            let outcome =
                run_command(&ctx, "echo line", dir.path(), &base_env(), &stdout, &stderr).unwrap();
            assert_eq!(outcome.exit_code, 0);
        }
        let content = std::fs::read_to_string(&stdout).unwrap();
        assert_eq!(content, "line\nline\n");
    }

    #[test]
    fn environment_changes_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        let ctx = RunContext::default();

        let outcome = run_command(
            &ctx,
            "export MARKER=42",
            dir.path(),
            &base_env(),
            &stdout,
            &stderr,
        )
        .unwrap();
        let env = outcome.env.unwrap();
        assert_eq!(env.get("MARKER").map(String::as_str), Some("42"));
        // Snapshot file is consumed.
        assert!(!dir.path().join(ENV_SNAPSHOT).exists());
    }

    #[test]
    fn injected_environment_reaches_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        let ctx = RunContext::default();

        let mut env = base_env();
        env.insert("NUMBER".to_string(), "4".to_string());
        run_command(&ctx, "echo \"n=$NUMBER\"", dir.path(), &env, &stdout, &stderr).unwrap();
        let content = std::fs::read_to_string(&stdout).unwrap();
        assert_eq!(content.trim(), "n=4");
    }

    #[test]
    fn failure_reports_exit_code_and_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        let ctx = RunContext::default();

        let outcome = run_command(
            &ctx,
            "echo oops >&2; exit 3",
            dir.path(),
            &base_env(),
            &stdout,
            &stderr,
        )
        .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.env.is_none());

        let message = failure_message("echo oops >&2; exit 3", dir.path(), &stderr, 3);
        assert!(message.contains("exit code 3"));
        assert!(message.contains("oops"));
    }

    #[test]
    fn empty_command_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::default();
        let outcome = run_command(
            &ctx,
            "   ",
            dir.path(),
            &base_env(),
            &dir.path().join("stdout"),
            &dir.path().join("stderr"),
        )
        .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }
}
