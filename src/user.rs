//! Per-container system users and filesystem layout.
//!
//! Each container id doubles as a system user name. The user's home is a
//! root-owned jail at `/users/<id>` (traversable, not writable) whose
//! `data` subdirectory bind-mounts the container data directory at
//! `/containers/<id>`, so the user's writable surface is the same bytes
//! the container sees.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::command;
use crate::config;

/// Home jail of a container user.
pub fn home_dir(id: &str) -> PathBuf {
    Path::new(config::USERS_ROOT).join(id)
}

/// Bind-mount target inside the jail.
pub fn data_dir(id: &str) -> PathBuf {
    home_dir(id).join("data")
}

/// Container data directory (the bind-mount source).
pub fn container_dir(id: &str) -> PathBuf {
    Path::new(config::CONTAINERS_ROOT).join(id)
}

/// Whether the system user exists, probed with `id`.
pub async fn user_exists(id: &str) -> Result<bool> {
    let out = command::run_unchecked("id", &[id]).await?;
    Ok(out.code == 0)
}

/// Creates the user if missing, prepares the directories and mounts the
/// data directory. Safe to call repeatedly.
pub async fn ensure_user(id: &str) -> Result<()> {
    if !user_exists(id).await? {
        tracing::info!("creating user {id}");
        let home = home_dir(id);
        command::run(
            "useradd",
            &[
                "-m",
                "-d",
                home.to_str().context("home path not utf-8")?,
                "-G",
                config::GROUP,
                "--shell",
                "/bin/false",
                id,
            ],
        )
        .await
        .context("creating user")?;
        tracing::info!("resetting password for {id}");
        reset_password(id).await.context("resetting password")?;
    }
    ready_fs(id).await.context("preparing fs")?;
    mount_data_dir(id).await.context("mounting data dir")?;
    // Scaffold ~/.ssh/authorized_keys so key provisioning can append later.
    get_keys(id).await.context("preparing ssh keys")?;
    Ok(())
}

/// Builds `uid:gid` for the user and the shared group, for chown.
async fn perm_snippet(id: &str) -> Result<String> {
    let user = nix::unistd::User::from_name(id)
        .context("looking up user")?
        .ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
    let group = nix::unistd::Group::from_name(config::GROUP)
        .context("looking up group")?
        .ok_or_else(|| anyhow::anyhow!("group {} not found", config::GROUP))?;
    Ok(format!("{}:{}", user.uid.as_raw(), group.gid.as_raw()))
}

/// Prepares the jail and data directories with the expected ownership.
pub async fn ready_fs(id: &str) -> Result<()> {
    let home = home_dir(id);
    let home_str = home.to_str().context("home path not utf-8")?;
    tokio::fs::create_dir_all(&home).await?;
    tracing::info!("jailing user {id}");
    command::run("chown", &["root:root", home_str]).await?;
    command::run("chmod", &["755", home_str]).await?;
    tokio::fs::create_dir_all(data_dir(id)).await?;
    tokio::fs::create_dir_all(container_dir(id)).await?;
    let perm = perm_snippet(id).await?;
    let dir = container_dir(id);
    command::run(
        "chown",
        &["-R", &perm, dir.to_str().context("data path not utf-8")?],
    )
    .await?;
    tracing::debug!("readied fs for {id}");
    Ok(())
}

/// Bind-mounts `/containers/<id>` onto the jail's data directory, once.
pub async fn mount_data_dir(id: &str) -> Result<()> {
    let target = data_dir(id);
    let target_str = target.to_str().context("data path not utf-8")?;
    if is_mountpoint(target_str).await? {
        tracing::debug!("{target_str} already mounted");
        return Ok(());
    }
    tracing::info!("mounting data dir for {id}");
    let source = container_dir(id);
    command::run(
        "mount",
        &[
            "--bind",
            source.to_str().context("source path not utf-8")?,
            target_str,
        ],
    )
    .await
    .map(|_| ())
}

/// Lazily unmounts the jail's data directory if it is mounted.
pub async fn unmount_data_dir(id: &str) -> Result<()> {
    let target = data_dir(id);
    let target_str = target.to_str().context("data path not utf-8")?;
    if !is_mountpoint(target_str).await? {
        return Ok(());
    }
    tracing::info!("unmounting data dir for {id}");
    command::run("umount", &["-l", target_str]).await.map(|_| ())
}

async fn is_mountpoint(path: &str) -> Result<bool> {
    let out = command::run_unchecked("mountpoint", &["-q", path]).await?;
    Ok(out.code == 0)
}

/// Deletes the system user together with its home.
pub async fn delete_user(id: &str) -> Result<()> {
    tracing::info!("deleting user {id}");
    command::run("deluser", &["--remove-home", id])
        .await
        .map(|_| ())
}

/// Removes the container data directory.
pub async fn clear_data_dir(id: &str) -> Result<()> {
    tracing::info!("clearing data for {id}");
    let dir = container_dir(id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
    }
}

// =============================================================================
// Passwords
// =============================================================================

/// Generates a fresh 32-character password: exactly 10 digits, letters
/// otherwise, no symbols.
pub fn generate_password() -> String {
    use rand::seq::SliceRandom;
    use rand::Rng;

    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"0123456789";

    let mut rng = rand::thread_rng();
    let mut chars: Vec<char> = Vec::with_capacity(32);
    for _ in 0..10 {
        chars.push(DIGITS[rng.gen_range(0..DIGITS.len())] as char);
    }
    for _ in 0..22 {
        chars.push(LETTERS[rng.gen_range(0..LETTERS.len())] as char);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

/// Rotates the user's password via `chpasswd` and returns the plaintext.
pub async fn reset_password(id: &str) -> Result<String> {
    let password = generate_password();
    command::run_with_stdin("chpasswd", &[], format!("{id}:{password}").as_bytes())
        .await
        .context("failed to reset password")?;
    Ok(password)
}

// =============================================================================
// SSH keys
// =============================================================================

fn ssh_dir(id: &str) -> PathBuf {
    home_dir(id).join(".ssh")
}

fn authorized_keys_path(id: &str) -> PathBuf {
    ssh_dir(id).join("authorized_keys")
}

/// Lists the authorized keys, creating `~/.ssh/authorized_keys` (0600,
/// owned by the user) on first use. Keys themselves arrive out of band,
/// paired with the sshd setup on the host image.
pub async fn get_keys(id: &str) -> Result<Vec<String>> {
    let dir = ssh_dir(id);
    tokio::fs::create_dir_all(&dir)
        .await
        .context("failed to create .ssh directory")?;

    let path = authorized_keys_path(id);
    if tokio::fs::metadata(&path).await.is_err() {
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .await
            .context("failed to create authorized_keys")?;
    }

    let owner = format!("{}:{}", id, config::GROUP);
    command::run(
        "chown",
        &["-R", &owner, dir.to_str().context(".ssh path not utf-8")?],
    )
    .await
    .context("failed to chown .ssh directory")?;

    let content = tokio::fs::read_to_string(&path)
        .await
        .context("failed to read authorized_keys")?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Paths
    // =========================================================================

    #[test]
    fn test_directory_layout() {
        assert_eq!(home_dir("x"), PathBuf::from("/users/x"));
        assert_eq!(data_dir("x"), PathBuf::from("/users/x/data"));
        assert_eq!(container_dir("x"), PathBuf::from("/containers/x"));
        assert_eq!(
            authorized_keys_path("x"),
            PathBuf::from("/users/x/.ssh/authorized_keys")
        );
    }

    // =========================================================================
    // Passwords
    // =========================================================================

    #[test]
    fn test_password_shape() {
        for _ in 0..100 {
            let pw = generate_password();
            assert_eq!(pw.len(), 32);
            assert_eq!(pw.chars().filter(|c| c.is_ascii_digit()).count(), 10);
            assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_passwords_differ() {
        assert_ne!(generate_password(), generate_password());
    }
}
