//! Managed container model and runtime lifecycle.
//!
//! A managed container is identified by the opaque id the control plane
//! assigns; the runtime name is `sb-<id>`, the data directory is
//! `/containers/<id>` and the home jail is `/users/<id>`. Lifecycle
//! operations talk to the Docker daemon through bollard; user, filesystem
//! and firewall side effects are delegated to the sibling modules.

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config;
use crate::errors::{is_unknown_container, SupervisorError};
use crate::firewall::Firewall;
use crate::hardware;
use crate::user;

/// Protocols every exposed port is bound for.
pub const PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// Packet verdict applied to matching remotes of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "DROP")]
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        }
    }

    /// The verdict applied to every source the remotes list does not match.
    pub fn complement(&self) -> Policy {
        match self {
            Self::Accept => Self::Drop,
            Self::Drop => Self::Accept,
        }
    }
}

/// One exposed port with its remote policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub policy: Policy,
    #[serde(default)]
    pub remotes: Vec<String>,
}

/// A container as known to the control plane and the local runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Set when a branch-backed container was just created and must not be
    /// started until its first deploy lands. Transient, never on the wire.
    #[serde(skip)]
    pub expecting_first_commit: bool,
}

impl Container {
    /// Runtime name of this container.
    pub fn name(&self) -> String {
        format!("{}{}", config::NAME_PREFIX, self.id)
    }

    /// Host-side source of the data bind mount.
    pub async fn host_dir(&self, docker: &Docker) -> Result<String> {
        let root = hardware::host_path(docker).await?;
        Ok(format!("{}/{}", root.trim_end_matches('/'), self.id))
    }

    /// Resolves the runtime container id, or the unknown-container
    /// sentinel when no `sb-<id>` container exists.
    pub async fn runtime_id(&self, docker: &Docker) -> Result<String> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^/{}$", self.name())]);
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        containers
            .first()
            .and_then(|c| c.id.clone())
            .ok_or_else(|| SupervisorError::UnknownContainer.into())
    }

    /// Current runtime status string (`running`, `paused`, ...).
    pub async fn status(&self, docker: &Docker) -> Result<String> {
        let cid = self.runtime_id(docker).await?;
        let inspect = docker.inspect_container(&cid, None).await?;
        let status = inspect
            .state
            .and_then(|s| s.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);
        Ok(status_str(status).to_string())
    }

    // =========================================================================
    // Create / update / destroy
    // =========================================================================

    /// Full creation pathway: user, jail, mounts, then the runtime side.
    pub async fn create(&self, docker: &Docker) -> Result<()> {
        user::ensure_user(&self.id).await?;
        self.update(docker).await
    }

    /// Pulls the image, recreates the runtime container and refreshes the
    /// firewall. Starts the container unless the first-commit gate holds.
    pub async fn update(&self, docker: &Docker) -> Result<()> {
        self.pull_image(docker).await?;
        self.recreate(docker).await?;
        self.install_firewall().await?;
        if self.first_commit_gated() {
            tracing::info!(
                "container {} awaits its first deploy, not starting",
                self.name()
            );
            return Ok(());
        }
        self.start(docker).await
    }

    /// Whether the container must stay stopped until a deploy lands.
    pub fn first_commit_gated(&self) -> bool {
        self.expecting_first_commit && self.branch.is_some()
    }

    /// Installs or refreshes the per-container firewall chain.
    pub async fn install_firewall(&self) -> Result<()> {
        Firewall::new(&self.id, &self.address, self.ports.clone())?
            .install()
            .await
    }

    /// Removes everything related to the container: runtime state, system
    /// user, data directory and firewall chain.
    pub async fn destroy(&self, docker: &Docker) -> Result<()> {
        self.delete_runtime_container(docker).await?;
        user::unmount_data_dir(&self.id).await?;
        user::delete_user(&self.id).await?;
        if config::skip_clean() {
            tracing::info!("SKIP_CLEAN set, keeping data of {}", self.id);
        } else {
            user::clear_data_dir(&self.id).await?;
        }
        Firewall::for_teardown(&self.id, &self.address)
            .uninstall()
            .await
    }

    /// Pulls the configured image, streaming progress to stdout.
    pub async fn pull_image(&self, docker: &Docker) -> Result<()> {
        tracing::info!("pulling image {}", self.image);
        let mut stream = docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: self.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            let info = item.context("error reading image pull stream")?;
            if let Some(status) = info.status {
                match info.progress {
                    Some(progress) => println!("{status} {progress}"),
                    None => println!("{status}"),
                }
            }
        }
        Ok(())
    }

    /// Stops and removes any existing `sb-<id>` container, then creates a
    /// fresh one with the current bindings, envs and data mount.
    pub async fn recreate(&self, docker: &Docker) -> Result<()> {
        if self.runtime_id(docker).await.is_ok() {
            // The daemon answers 304 for an already-stopped container; the
            // removal below is forced either way.
            if let Err(e) = self.stop(docker).await {
                tracing::debug!("stop before recreate: {e:#}");
            }
            self.delete_runtime_container(docker).await?;
        }
        tracing::info!("creating container {}", self.name());

        let (exposed_ports, port_bindings) = self.port_map();
        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(self.host_dir(docker).await?),
                target: Some(self.mount.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let config = Config::<String> {
            image: Some(self.image.clone()),
            env: Some(self.env_list()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.name(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("creating container")?;
        Ok(())
    }

    /// Force-removes the runtime container; a missing container is fine.
    pub async fn delete_runtime_container(&self, docker: &Docker) -> Result<()> {
        tracing::info!("deleting container {}", self.name());
        let cid = match self.runtime_id(docker).await {
            Ok(cid) => cid,
            Err(e) if is_unknown_container(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        docker
            .remove_container(
                &cid,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .context("removing container")
    }

    // =========================================================================
    // Power operations
    // =========================================================================

    pub async fn start(&self, docker: &Docker) -> Result<()> {
        tracing::info!("starting container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker
            .start_container(&cid, None::<StartContainerOptions<String>>)
            .await
            .context("starting container")
    }

    pub async fn stop(&self, docker: &Docker) -> Result<()> {
        tracing::info!("stopping container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker
            .stop_container(&cid, None::<StopContainerOptions>)
            .await
            .context("stopping container")
    }

    pub async fn restart(&self, docker: &Docker) -> Result<()> {
        tracing::info!("restarting container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker
            .restart_container(&cid, None)
            .await
            .context("restarting container")
    }

    pub async fn pause(&self, docker: &Docker) -> Result<()> {
        tracing::info!("pausing container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker.pause_container(&cid).await.context("pausing container")
    }

    pub async fn unpause(&self, docker: &Docker) -> Result<()> {
        tracing::info!("unpausing container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker
            .unpause_container(&cid)
            .await
            .context("unpausing container")
    }

    pub async fn kill(&self, docker: &Docker) -> Result<()> {
        tracing::info!("killing container {}", self.name());
        let cid = self.runtime_id(docker).await?;
        docker
            .kill_container(
                &cid,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
            .context("killing container")
    }

    // =========================================================================
    // Creation parameters
    // =========================================================================

    /// Exposed ports and host bindings: every port is exposed for tcp and
    /// udp and bound to `<address>:<port>`.
    fn port_map(
        &self,
    ) -> (
        HashMap<String, HashMap<(), ()>>,
        HashMap<String, Option<Vec<PortBinding>>>,
    ) {
        let mut exposed = HashMap::new();
        let mut bindings = HashMap::new();
        for port in &self.ports {
            for proto in PROTOCOLS {
                let key = format!("{}/{}", port.port, proto);
                exposed.insert(key.clone(), HashMap::new());
                bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some(self.address.clone()),
                        host_port: Some(port.port.to_string()),
                    }]),
                );
            }
        }
        (exposed, bindings)
    }

    /// Environment flattened as `K=V`.
    fn env_list(&self) -> Vec<String> {
        self.envs.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Stable string form of a runtime status.
fn status_str(status: ContainerStateStatusEnum) -> &'static str {
    match status {
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
        ContainerStateStatusEnum::EMPTY => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Container {
        serde_json::from_value(serde_json::json!({
            "id": "x",
            "image": "nginx",
            "address": "1.2.3.4",
            "mount": "/srv",
            "envs": {"A": "1"},
            "ports": [{"port": 80, "policy": "ACCEPT", "remotes": ["10.0.0.0/8"]}],
        }))
        .unwrap()
    }

    // =========================================================================
    // Model
    // =========================================================================

    #[test]
    fn test_desired_set_decode() {
        let c = sample();
        assert_eq!(c.name(), "sb-x");
        assert_eq!(c.image, "nginx");
        assert_eq!(c.envs.get("A").map(String::as_str), Some("1"));
        assert_eq!(c.ports.len(), 1);
        assert_eq!(c.ports[0].policy, Policy::Accept);
        assert!(c.branch.is_none());
        assert!(!c.expecting_first_commit);
    }

    #[test]
    fn test_first_commit_flag_not_serialized() {
        let mut c = sample();
        c.expecting_first_commit = true;
        let value = serde_json::to_value(&c).unwrap();
        assert!(value.get("expecting_first_commit").is_none());
    }

    #[test]
    fn test_policy_wire_names() {
        assert_eq!(serde_json::to_value(Policy::Accept).unwrap(), "ACCEPT");
        assert_eq!(serde_json::to_value(Policy::Drop).unwrap(), "DROP");
        let p: Policy = serde_json::from_str("\"DROP\"").unwrap();
        assert_eq!(p, Policy::Drop);
    }

    #[test]
    fn test_policy_complement() {
        assert_eq!(Policy::Accept.complement(), Policy::Drop);
        assert_eq!(Policy::Drop.complement(), Policy::Accept);
    }

    #[test]
    fn test_first_commit_gate_requires_branch() {
        let mut c = sample();
        c.expecting_first_commit = true;
        assert!(!c.first_commit_gated());
        c.branch = Some("main".to_string());
        assert!(c.first_commit_gated());
        c.expecting_first_commit = false;
        assert!(!c.first_commit_gated());
    }

    // =========================================================================
    // Creation parameters
    // =========================================================================

    #[test]
    fn test_port_map_binds_both_protocols() {
        let c = sample();
        let (exposed, bindings) = c.port_map();

        assert_eq!(exposed.len(), 2);
        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("80/udp"));

        for key in ["80/tcp", "80/udp"] {
            let binding = bindings[key].as_ref().unwrap();
            assert_eq!(binding.len(), 1);
            assert_eq!(binding[0].host_ip.as_deref(), Some("1.2.3.4"));
            assert_eq!(binding[0].host_port.as_deref(), Some("80"));
        }
    }

    #[test]
    fn test_env_flattening() {
        let mut c = sample();
        c.envs.insert("B".to_string(), "two".to_string());
        let mut env = c.env_list();
        env.sort();
        assert_eq!(env, vec!["A=1".to_string(), "B=two".to_string()]);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status_str(ContainerStateStatusEnum::RUNNING), "running");
        assert_eq!(status_str(ContainerStateStatusEnum::PAUSED), "paused");
        assert_eq!(status_str(ContainerStateStatusEnum::EXITED), "exited");
        assert_eq!(status_str(ContainerStateStatusEnum::EMPTY), "");
    }
}
