//! Hardware probe.
//!
//! Collects the inventory snapshot pushed to the control plane on connect:
//! CPUs, memory, publicly addressed interfaces, storage usage of the
//! container data root, and the hostname. The probe is read-only and
//! refuses to run for a non-root caller.

use anyhow::{Context, Result};
use bollard::container::ListContainersOptions;
use bollard::models::MountPointTypeEnum;
use bollard::Docker;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::config;

/// One CPU package as reported to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct Cpu {
    pub model: String,
    pub vendor: String,
    /// Clock in MHz.
    pub frequency: f64,
    /// Core path label, e.g. `cpu0`.
    pub path: String,
    pub cores: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    /// Total size in bytes.
    pub size: u64,
    /// Module speed in MT/s; 0 when not exposed by the platform.
    pub speed: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A public address on an interface, kept in CIDR form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub ip: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Interface {
    pub speed: u64,
    pub name: String,
    /// Public addresses only; interfaces without any are dropped.
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Storage {
    pub path: String,
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hardware {
    pub cpus: Vec<Cpu>,
    pub memory: Memory,
    pub storage: Storage,
    pub interfaces: Vec<Interface>,
    pub hostname: String,
}

/// Collects the full hardware snapshot.
pub async fn probe(docker: &Docker) -> Result<Hardware> {
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("not root");
    }

    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();

    let cpus = collect_cpus(&sys);
    let memory = Memory {
        size: sys.total_memory(),
        speed: 0,
        kind: "unknown".to_string(),
    };
    let interfaces = collect_interfaces(config::test_eth0())?;
    let storage = collect_storage(docker).await?;
    let hostname = hostname()?;

    Ok(Hardware {
        cpus,
        memory,
        storage,
        interfaces,
        hostname,
    })
}

fn collect_cpus(sys: &sysinfo::System) -> Vec<Cpu> {
    // Logical CPUs grouped by package identity; sysinfo reports one entry
    // per logical core.
    let mut grouped: Vec<Cpu> = Vec::new();
    for cpu in sys.cpus() {
        let model = cpu.brand().to_string();
        let vendor = cpu.vendor_id().to_string();
        match grouped
            .iter_mut()
            .find(|c| c.model == model && c.vendor == vendor)
        {
            Some(existing) => existing.cores += 1,
            None => grouped.push(Cpu {
                model,
                vendor,
                frequency: cpu.frequency() as f64,
                path: cpu.name().to_string(),
                cores: 1,
            }),
        }
    }
    grouped
}

fn hostname() -> Result<String> {
    let uts = nix::sys::utsname::uname().context("uname failed")?;
    Ok(uts.nodename().to_string_lossy().into_owned())
}

// =============================================================================
// Interfaces
// =============================================================================

fn collect_interfaces(test_eth0: bool) -> Result<Vec<Interface>> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut interfaces = Vec::new();
    for (name, data) in &networks {
        let addresses: Vec<Address> = data
            .ip_networks()
            .iter()
            .filter(|net| is_public(&net.addr))
            .map(|net| Address {
                ip: format!("{}/{}", net.addr, net.prefix),
                version: version_label(&net.addr).to_string(),
            })
            .collect();
        if !addresses.is_empty() {
            interfaces.push(Interface {
                speed: link_speed(name),
                name: name.clone(),
                addresses,
            });
        }
    }
    finalize_interfaces(interfaces, test_eth0)
}

/// Applies the `TEST_ETH0` fallback and the no-interface failure.
fn finalize_interfaces(mut interfaces: Vec<Interface>, test_eth0: bool) -> Result<Vec<Interface>> {
    if interfaces.is_empty() && test_eth0 {
        interfaces.push(Interface {
            speed: 1,
            name: "eth0".to_string(),
            addresses: vec![Address {
                ip: "1.1.1.1/32".to_string(),
                version: "IPv4".to_string(),
            }],
        });
    }
    if interfaces.is_empty() {
        anyhow::bail!(
            "no interfaces found. the device must be directly addressed using at least a public (non-private) IP"
        );
    }
    Ok(interfaces)
}

/// Whether an address is routable from the outside.
///
/// Loopback, RFC1918/unique-local, link-local and unspecified addresses are
/// all rejected.
fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            let unique_local = (seg0 & 0xfe00) == 0xfc00;
            let link_local = (seg0 & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

fn version_label(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IPv4",
        IpAddr::V6(_) => "IPv6",
    }
}

/// Link speed in Mb/s from sysfs; 0 when unknown or the link is down.
fn link_speed(name: &str) -> u64 {
    std::fs::read_to_string(format!("/sys/class/net/{name}/speed"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|speed| *speed > 0)
        .map(|speed| speed as u64)
        .unwrap_or(0)
}

// =============================================================================
// Storage
// =============================================================================

/// Resolves the host-side source of the agent's `/containers` bind mount.
///
/// The agent runs as a container named `serverbench`; the host path is
/// whatever that container's data-root mount points at.
pub async fn host_path(docker: &Docker) -> Result<String> {
    let mut filters = HashMap::new();
    filters.insert(
        "name".to_string(),
        vec![format!("^/{}$", config::SELF_CONTAINER)],
    );
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            filters,
            ..Default::default()
        }))
        .await
        .context("listing own container")?;
    let own = containers
        .first()
        .ok_or_else(|| anyhow::anyhow!("unknown self container"))?;

    own.mounts
        .iter()
        .flatten()
        .find(|m| {
            m.typ == Some(MountPointTypeEnum::BIND)
                && m.destination.as_deref() == Some(config::CONTAINERS_ROOT)
        })
        .and_then(|m| m.source.clone())
        .ok_or_else(|| anyhow::anyhow!("unknown self container mount"))
}

async fn collect_storage(docker: &Docker) -> Result<Storage> {
    let stat = nix::sys::statvfs::statvfs(config::CONTAINERS_ROOT)
        .with_context(|| format!("statvfs {}", config::CONTAINERS_ROOT))?;
    let frsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frsize;
    let used = (stat.blocks() as u64 - stat.blocks_free() as u64) * frsize;
    let path = host_path(docker).await?;
    Ok(Storage { path, total, used })
}

/// Empty snapshot for tests that need a machine but no real probe.
#[cfg(test)]
pub(crate) fn test_hardware() -> Hardware {
    Hardware {
        cpus: Vec::new(),
        memory: Memory {
            size: 0,
            speed: 0,
            kind: "unknown".to_string(),
        },
        storage: Storage {
            path: "/".to_string(),
            total: 0,
            used: 0,
        },
        interfaces: Vec::new(),
        hostname: "test".to_string(),
    }
}
