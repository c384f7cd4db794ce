//! Subprocess helper for privileged side effects.
//!
//! useradd, chpasswd, mount, umount, rsync, git and the iptables wrappers
//! are all invoked as child processes. Everything goes through `run` (or
//! `run_with_stdin` for chpasswd) so exit-code handling and stderr capture
//! live in one place.

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Output of a finished subprocess.
#[derive(Debug)]
pub struct CmdOutput {
    /// Exit code, -1 when terminated by signal.
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Runs a command to completion, failing on a non-zero exit.
///
/// The error message carries the command line and captured stderr, which is
/// what ends up in the log when a privileged operation fails.
pub async fn run(program: &str, args: &[&str]) -> Result<CmdOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;

    let out = CmdOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} failed with code {}: {}",
            args.join(" "),
            out.code,
            out.stderr.trim()
        );
    }
    Ok(out)
}

/// Like [`run`], but returns the output regardless of exit status.
///
/// Used where a non-zero exit is an answer rather than a failure (`id`,
/// `mountpoint`, iptables `-C` checks).
pub async fn run_unchecked(program: &str, args: &[&str]) -> Result<CmdOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;

    Ok(CmdOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs a command with the given bytes piped to stdin, failing on a
/// non-zero exit.
pub async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<CmdOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let mut stdin = child
        .stdin
        .take()
        .context("child stdin not captured")?;
    stdin.write_all(input).await?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {program}"))?;

    let out = CmdOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} failed with code {}: {}",
            args.join(" "),
            out.code,
            out.stderr.trim()
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_error() {
        let err = run("sh", &["-c", "echo oops >&2; exit 3"])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[tokio::test]
    async fn test_run_unchecked_reports_code() {
        let out = run_unchecked("sh", &["-c", "exit 7"]).await.unwrap();
        assert_eq!(out.code, 7);
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_error() {
        assert!(run("this-binary-does-not-exist-47", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_run_with_stdin_feeds_input() {
        let out = run_with_stdin("cat", &[], b"user:secret").await.unwrap();
        assert_eq!(out.stdout, "user:secret");
    }
}
