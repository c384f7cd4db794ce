//! Machine model, inventory discovery and reconciliation.
//!
//! The machine has no persistent local state: on every connect the managed
//! container set is reconstructed from the runtime (`sb-` name prefix) and
//! then reconciled against the control plane's desired set. The reconciler
//! is a plain id-set diff; operations run sequentially and the first error
//! aborts the batch.

use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::models::PortBinding;
use bollard::Docker;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config;
use crate::container::Container;
use crate::hardware::{self, Hardware};
use crate::user;

/// The supervised machine.
#[derive(Debug)]
pub struct Machine {
    /// Assigned by the control plane on handshake.
    pub id: Option<String>,
    /// Machine secret from the environment.
    pub key: String,
    pub hardware: Hardware,
    pub containers: Vec<Container>,
}

/// Handshake reply payload.
#[derive(Debug, Deserialize)]
pub struct Session {
    pub machine: SessionMachine,
}

#[derive(Debug, Deserialize)]
pub struct SessionMachine {
    pub id: String,
}

/// Extracts the managed id from a runtime container name.
fn managed_id(runtime_name: &str) -> Option<&str> {
    runtime_name.strip_prefix(config::RUNTIME_NAME_PREFIX)
}

/// First host IP found in a port-binding map.
fn first_bound_ip(bindings: Option<&HashMap<String, Option<Vec<PortBinding>>>>) -> String {
    bindings
        .into_iter()
        .flat_map(|map| map.values())
        .flatten()
        .flatten()
        .find_map(|binding| binding.host_ip.clone())
        .unwrap_or_default()
}

impl Machine {
    /// Builds the machine from the environment and the local runtime.
    ///
    /// Every discovered container gets its filesystem re-readied and its
    /// data directory re-mounted; a reboot clears bind mounts.
    pub async fn discover(docker: &Docker) -> Result<Machine> {
        let key = config::machine_key()?;
        let hardware = hardware::probe(docker).await?;

        let mut filters = HashMap::new();
        filters.insert(
            "name".to_string(),
            vec![format!("^{}", config::RUNTIME_NAME_PREFIX)],
        );
        let summaries = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("listing managed containers")?;

        let mut containers = Vec::new();
        for summary in summaries {
            let Some(id) = summary
                .names
                .iter()
                .flatten()
                .find_map(|n| managed_id(n))
                .map(str::to_string)
            else {
                continue;
            };
            let runtime_id = summary.id.clone().unwrap_or_default();
            let inspect = docker
                .inspect_container(&runtime_id, None)
                .await
                .with_context(|| format!("inspecting {id}"))?;
            let address = first_bound_ip(
                inspect
                    .host_config
                    .as_ref()
                    .and_then(|hc| hc.port_bindings.as_ref()),
            );
            let mount = summary
                .mounts
                .iter()
                .flatten()
                .find_map(|m| m.destination.clone())
                .unwrap_or_default();

            let container = Container {
                id,
                image: summary.image.clone().unwrap_or_default(),
                address,
                mount,
                ..Default::default()
            };
            user::ensure_user(&container.id)
                .await
                .with_context(|| format!("readying fs for {}", container.id))?;
            containers.push(container);
        }

        Ok(Machine {
            id: None,
            key,
            hardware,
            containers,
        })
    }

    /// Reconciles the local set against the server-authoritative one.
    ///
    /// Returns the newly created containers so the engine can acknowledge
    /// them. Created branch-backed containers start life behind the
    /// first-commit gate.
    pub async fn update_containers(
        &mut self,
        docker: &Docker,
        desired: Vec<Container>,
    ) -> Result<Vec<Container>> {
        let diff = diff(&self.containers, &desired);

        for container in &diff.removed {
            container
                .destroy(docker)
                .await
                .with_context(|| format!("destroying {}", container.id))?;
        }

        let mut created = Vec::new();
        for container in &diff.added {
            let mut container = container.clone();
            container.expecting_first_commit = container.branch.is_some();
            container
                .create(docker)
                .await
                .with_context(|| format!("creating {}", container.id))?;
            created.push(container);
        }

        // Surviving containers may carry changed port sets; refresh their
        // chains.
        for container in &diff.kept {
            container
                .install_firewall()
                .await
                .with_context(|| format!("refreshing firewall of {}", container.id))?;
        }

        let previous = std::mem::take(&mut self.containers);
        self.containers = desired
            .into_iter()
            .map(|mut c| {
                if created.iter().any(|n| n.id == c.id) {
                    c.expecting_first_commit = c.branch.is_some();
                } else if let Some(prev) = previous.iter().find(|p| p.id == c.id) {
                    c.expecting_first_commit = prev.expecting_first_commit;
                }
                c
            })
            .collect();

        tracing::info!(
            "{} created, {} deleted, {} final containers",
            created.len(),
            diff.removed.len(),
            self.containers.len()
        );
        Ok(created)
    }

    pub fn find_container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    /// Overwrites a container record with the server-supplied fields after
    /// an action, clearing the first-commit gate so later reconciliations
    /// are stable.
    pub fn apply_authoritative(&mut self, authoritative: &Container) {
        if let Some(existing) = self
            .containers
            .iter_mut()
            .find(|c| c.id == authoritative.id)
        {
            existing.ports = authoritative.ports.clone();
            existing.image = authoritative.image.clone();
            existing.branch = authoritative.branch.clone();
            existing.envs = authoritative.envs.clone();
            existing.mount = authoritative.mount.clone();
            existing.expecting_first_commit = false;
        }
    }

    /// Clears the first-commit gate after a successful deploy.
    pub fn clear_first_commit(&mut self, id: &str) {
        if let Some(container) = self.containers.iter_mut().find(|c| c.id == id) {
            container.expecting_first_commit = false;
        }
    }
}

/// Result of the id-set diff between the local and desired sets.
#[derive(Debug, Default)]
pub struct Diff {
    /// Present locally, absent from the desired set.
    pub removed: Vec<Container>,
    /// Absent locally, present in the desired set.
    pub added: Vec<Container>,
    /// Present in both; the desired (authoritative) version is kept.
    pub kept: Vec<Container>,
}

/// Pure diff over container id-sets.
pub fn diff(actual: &[Container], desired: &[Container]) -> Diff {
    let actual_ids: HashMap<&str, &Container> =
        actual.iter().map(|c| (c.id.as_str(), c)).collect();
    let desired_ids: HashMap<&str, ()> = desired.iter().map(|c| (c.id.as_str(), ())).collect();

    let mut result = Diff::default();
    for container in actual {
        if !desired_ids.contains_key(container.id.as_str()) {
            result.removed.push(container.clone());
        }
    }
    for container in desired {
        if actual_ids.contains_key(container.id.as_str()) {
            result.kept.push(container.clone());
        } else {
            result.added.push(container.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str) -> Container {
        Container {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn ids(containers: &[Container]) -> Vec<&str> {
        containers.iter().map(|c| c.id.as_str()).collect()
    }

    // =========================================================================
    // Diff
    // =========================================================================

    #[test]
    fn test_diff_add_one() {
        let result = diff(&[], &[container("x")]);
        assert_eq!(ids(&result.added), vec!["x"]);
        assert!(result.removed.is_empty());
        assert!(result.kept.is_empty());
    }

    #[test]
    fn test_diff_remove_one() {
        let result = diff(&[container("y")], &[]);
        assert_eq!(ids(&result.removed), vec!["y"]);
        assert!(result.added.is_empty());
    }

    #[test]
    fn test_diff_empty_desired_removes_everything() {
        let result = diff(&[container("a"), container("b"), container("c")], &[]);
        assert_eq!(result.removed.len(), 3);
    }

    #[test]
    fn test_diff_mixed() {
        let actual = [container("keep"), container("drop")];
        let desired = [container("keep"), container("new")];
        let result = diff(&actual, &desired);
        assert_eq!(ids(&result.removed), vec!["drop"]);
        assert_eq!(ids(&result.added), vec!["new"]);
        assert_eq!(ids(&result.kept), vec!["keep"]);
    }

    #[test]
    fn test_diff_is_idempotent() {
        // Applying the same desired set over itself changes nothing.
        let desired = [container("a"), container("b")];
        let result = diff(&desired, &desired);
        assert!(result.added.is_empty());
        assert!(result.removed.is_empty());
        assert_eq!(result.kept.len(), 2);
    }

    #[test]
    fn test_diff_kept_uses_desired_version() {
        let mut old = container("x");
        old.image = "old:1".to_string();
        let mut new = container("x");
        new.image = "new:2".to_string();
        let result = diff(&[old], &[new]);
        assert_eq!(result.kept[0].image, "new:2");
    }

    // =========================================================================
    // Discovery helpers
    // =========================================================================

    #[test]
    fn test_managed_id_extraction() {
        assert_eq!(managed_id("/sb-x"), Some("x"));
        assert_eq!(managed_id("/sb-abc-def"), Some("abc-def"));
        assert_eq!(managed_id("/other"), None);
        assert_eq!(managed_id("sb-x"), None);
    }

    #[test]
    fn test_first_bound_ip() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("1.2.3.4".to_string()),
                host_port: Some("80".to_string()),
            }]),
        );
        assert_eq!(first_bound_ip(Some(&bindings)), "1.2.3.4");
        assert_eq!(first_bound_ip(None), "");
    }

    // =========================================================================
    // Record maintenance
    // =========================================================================

    fn test_machine(containers: Vec<Container>) -> Machine {
        Machine {
            id: Some("m1".to_string()),
            key: "k".to_string(),
            hardware: hardware::test_hardware(),
            containers,
        }
    }

    #[test]
    fn test_apply_authoritative_overwrites_and_clears_gate() {
        let mut machine = test_machine(vec![Container {
            id: "x".to_string(),
            image: "old:1".to_string(),
            expecting_first_commit: true,
            ..Default::default()
        }]);

        let update = Container {
            id: "x".to_string(),
            image: "new:2".to_string(),
            branch: Some("main".to_string()),
            mount: "/srv".to_string(),
            ..Default::default()
        };
        machine.apply_authoritative(&update);

        let c = machine.find_container("x").unwrap();
        assert_eq!(c.image, "new:2");
        assert_eq!(c.branch.as_deref(), Some("main"));
        assert_eq!(c.mount, "/srv");
        assert!(!c.expecting_first_commit);
    }

    #[test]
    fn test_apply_authoritative_unknown_id_is_noop() {
        let mut machine = test_machine(vec![container("x")]);
        machine.apply_authoritative(&container("ghost"));
        assert_eq!(machine.containers.len(), 1);
        assert!(machine.find_container("ghost").is_none());
    }

    #[test]
    fn test_clear_first_commit() {
        let mut machine = test_machine(vec![Container {
            id: "x".to_string(),
            expecting_first_commit: true,
            ..Default::default()
        }]);
        machine.clear_first_commit("x");
        assert!(!machine.find_container("x").unwrap().expecting_first_commit);
    }

    #[test]
    fn test_session_decode() {
        let session: Session =
            serde_json::from_str(r#"{"machine":{"id":"m1"}}"#).unwrap();
        assert_eq!(session.machine.id, "m1");
    }
}
