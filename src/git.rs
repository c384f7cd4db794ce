//! Source deployment into container data directories.
//!
//! A branch-backed container gets its code via git. The first deploy has
//! to turn a possibly non-empty data directory into a clone without losing
//! files, so it pulls the existing content aside, clones, and brings the
//! content back underneath (`--ignore-existing`, so the repository wins on
//! conflicts). Subsequent deploys rotate the remote URL (tokens expire),
//! check out the branch and rebase-pull.
//!
//! Pulls are refused while the container is paused. A running container is
//! stopped for the duration and restarted afterwards; a first deploy
//! always ends in a start.

use anyhow::{Context, Result};
use bollard::Docker;
use rand::Rng;
use std::path::PathBuf;

use crate::command;
use crate::container::Container;
use crate::errors::SupervisorError;
use crate::user;

/// Commit report for a data directory that is not a repository yet.
const NO_COMMIT: &str = "no commit";

/// Builds the token-authenticated remote URL.
fn remote_url(token: &str, domain: &str, uri: &str) -> String {
    format!("https://x-access-token:{token}@{domain}/{uri}")
}

/// Ensures a trailing slash so rsync copies directory contents.
fn append_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn random_suffix() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

impl Container {
    fn temporary_folder(&self, suffix: &str) -> PathBuf {
        user::home_dir(&self.id).join(format!("tmp-{suffix}"))
    }

    async fn is_git_repository(&self) -> Result<bool> {
        let git_dir = user::container_dir(&self.id).join(".git");
        match tokio::fs::metadata(&git_dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("checking for git repository"),
        }
    }

    /// Marks the data directory safe for git invoked as root.
    async fn whitelist(&self) -> Result<()> {
        let data = user::container_dir(&self.id);
        tracing::info!("whitelisting repo {}", data.display());
        command::run(
            "git",
            &[
                "config",
                "--global",
                "--add",
                "safe.directory",
                data.to_str().context("data path not utf-8")?,
            ],
        )
        .await
        .map(|_| ())
    }

    /// Reports the trimmed `rev-parse HEAD` hash, or the literal
    /// `no commit` for a branch-less container or a data directory that
    /// is not a repository yet.
    pub async fn commit(&self) -> Result<String> {
        if self.branch.is_none() {
            return Ok(NO_COMMIT.to_string());
        }
        if !self.is_git_repository().await? {
            return Ok(NO_COMMIT.to_string());
        }
        self.whitelist().await?;
        let data = user::container_dir(&self.id);
        let out = command::run(
            "git",
            &[
                "-C",
                data.to_str().context("data path not utf-8")?,
                "rev-parse",
                "HEAD",
            ],
        )
        .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Deploys `branch` from the remote into the data directory, then
    /// recreates the container and restarts it when appropriate.
    pub async fn pull(
        &self,
        docker: &Docker,
        token: &str,
        uri: &str,
        branch: &str,
        domain: &str,
    ) -> Result<()> {
        tracing::info!(
            "pulling repository for {} ({} commit)",
            self.name(),
            if self.expecting_first_commit {
                "first"
            } else {
                "subsequent"
            }
        );

        let mut should_restart = self.expecting_first_commit;
        let status = self.status(docker).await?;
        if status == "paused" {
            return Err(SupervisorError::Frozen.into());
        }
        if status == "running" || status == "restarting" {
            tracing::info!("stopping {} for pull, will restart after", self.name());
            self.stop(docker).await?;
            should_restart = true;
        }

        let git_url = remote_url(token, domain, uri);
        let data = user::container_dir(&self.id);
        let data_str = data.to_str().context("data path not utf-8")?;

        let mut freshly_cloned = false;
        if !self.is_git_repository().await? {
            tracing::info!("data dir of {} is not a repository, initializing", self.name());
            let suffix = self.pull_aside().await?;
            let clone = command::run(
                "git",
                &[
                    "-C", data_str, "clone", "--depth", "1", "-b", branch, &git_url, ".",
                ],
            )
            .await;
            match clone {
                Ok(out) => tracing::info!("{}", out.stderr.trim()),
                Err(e) => {
                    // Bring the original content back regardless, so a
                    // failed clone never loses data.
                    let _ = self.bring_together(&suffix).await;
                    return Err(e).context("initializing repository");
                }
            }
            self.bring_together(&suffix).await?;
            freshly_cloned = true;
        }

        self.whitelist().await?;
        tracing::info!("resetting repo");
        command::run("git", &["-C", data_str, "reset", "--hard"]).await?;
        tracing::info!("cleaning repo");
        command::run("git", &["-C", data_str, "clean", "-dff"]).await?;

        if !freshly_cloned {
            tracing::info!("updating remote");
            command::run(
                "git",
                &["-C", data_str, "remote", "set-url", "origin", &git_url],
            )
            .await?;
            tracing::info!("checking out {branch}");
            command::run("git", &["-C", data_str, "checkout", branch]).await?;
            tracing::info!("pulling changes");
            command::run("git", &["-C", data_str, "pull", "--progress", "--rebase"]).await?;
        }

        // Recreate so repository-provided files (.env and friends) are
        // picked up, and restore the filesystem layout.
        self.delete_runtime_container(docker).await?;
        self.recreate(docker).await?;
        user::ready_fs(&self.id).await?;

        if should_restart {
            tracing::info!("restarting {} to match its pre-pull state", self.name());
            self.start(docker).await?;
        }
        tracing::info!("finished pulling");
        Ok(())
    }

    /// Moves the current data-directory content into a temporary folder
    /// inside the home jail, leaving the data directory empty.
    async fn pull_aside(&self) -> Result<String> {
        tracing::info!("pulling data aside");
        let suffix = random_suffix();
        let target = self.temporary_folder(&suffix);
        tokio::fs::create_dir_all(&target).await?;
        let origin = user::container_dir(&self.id);
        let result = command::run(
            "rsync",
            &[
                "-a",
                "--remove-source-files",
                &append_slash(origin.to_str().context("data path not utf-8")?),
                target.to_str().context("tmp path not utf-8")?,
            ],
        )
        .await;
        if let Err(e) = result {
            let _ = self.bring_together(&suffix).await;
            return Err(e).context("pulling aside");
        }
        clear_dir_contents(&origin).await?;
        Ok(suffix)
    }

    /// Moves pulled-aside content back under the (now cloned) data
    /// directory without overwriting repository files.
    async fn bring_together(&self, suffix: &str) -> Result<()> {
        tracing::info!("bringing aside data back");
        let tmp = self.temporary_folder(suffix);
        let origin = user::container_dir(&self.id);
        command::run(
            "rsync",
            &[
                "-a",
                "--remove-source-files",
                "--ignore-existing",
                &append_slash(tmp.to_str().context("tmp path not utf-8")?),
                origin.to_str().context("data path not utf-8")?,
            ],
        )
        .await
        .context("bringing together")?;
        if let Err(e) = tokio::fs::remove_dir_all(&tmp).await {
            tracing::error!("error cleaning up {}: {e}", tmp.display());
        }
        Ok(())
    }
}

/// Empties a directory without removing the directory itself.
async fn clear_dir_contents(dir: &std::path::Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
