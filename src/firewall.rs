//! Per-container firewall chains.
//!
//! Every managed container gets its own chain in the `filter` table,
//! jumped to from a shared parent chain that sits at position 1 of
//! `DOCKER-USER` so it runs before the runtime's own rules:
//!
//! ```text
//! DOCKER-USER ──insert 1──> serverbench ──jump──> sb-<id>
//! ```
//!
//! Rules match on the conntrack *original* tuple (`--ctorigdst`,
//! `--ctorigdstport`) so they apply to packets the runtime will DNAT into
//! the container. Per port, remote-specific matches jump to the port's
//! policy and a catch-all jumps to the complement, which expresses an
//! allowlist or denylist in a single pass.
//!
//! All operations are idempotent: chains are created on demand, rules are
//! append-unique, and repeated installs flush and rebuild the container
//! chain. The parent chain is never torn down.

use anyhow::{Context, Result};
use std::net::IpAddr;

use crate::command;
use crate::config;
use crate::container::{Policy, Port, PROTOCOLS};

const TABLE: &str = "filter";
const PARENT_CHAIN: &str = "serverbench";
const DOCKER_USER: &str = "DOCKER-USER";

/// Thin client over an iptables binary with check/append/insert/delete
/// semantics. Exit code 1 on `-C` / `-nL` means "not present"; anything
/// else non-zero is a real failure.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: &'static str,
}

impl Iptables {
    /// Selects the filter binary by address family.
    pub fn for_address(address: &str) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid address"))?;
        Ok(Self {
            program: family_program(&ip),
        })
    }

    async fn exec(&self, args: &[String]) -> Result<()> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        command::run(self.program, &refs).await?;
        Ok(())
    }

    /// Runs a query whose exit code 1 means "no".
    async fn query(&self, args: &[String]) -> Result<bool> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = command::run_unchecked(self.program, &refs).await?;
        match out.code {
            0 => Ok(true),
            1 => Ok(false),
            code => anyhow::bail!(
                "{} {} failed with code {}: {}",
                self.program,
                args.join(" "),
                code,
                out.stderr.trim()
            ),
        }
    }

    pub async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        self.query(&svec(&["-t", table, "-nL", chain])).await
    }

    pub async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.exec(&svec(&["-t", table, "-N", chain])).await
    }

    pub async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.exec(&svec(&["-t", table, "-F", chain])).await
    }

    /// Flushes and removes a chain.
    pub async fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.flush_chain(table, chain).await?;
        self.exec(&svec(&["-t", table, "-X", chain])).await
    }

    pub async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let mut args = svec(&["-t", table, "-C", chain]);
        args.extend_from_slice(rule);
        self.query(&args).await
    }

    /// Appends a rule unless it is already present.
    pub async fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = svec(&["-t", table, "-A", chain]);
        args.extend_from_slice(rule);
        self.exec(&args).await
    }

    /// Inserts a rule at `position` unless it is already present anywhere
    /// in the chain.
    pub async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<()> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = svec(&["-t", table, "-I", chain]);
        args.push(position.to_string());
        args.extend_from_slice(rule);
        self.exec(&args).await
    }

    /// Deletes a rule if present; absence is not an error.
    pub async fn delete_if_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if !self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = svec(&["-t", table, "-D", chain]);
        args.extend_from_slice(rule);
        self.exec(&args).await
    }
}

fn family_program(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => config::IPTABLES_PATH,
        IpAddr::V6(_) => config::IP6TABLES_PATH,
    }
}

fn svec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// The firewall state for one container.
pub struct Firewall {
    chain: String,
    address: String,
    ipt: Iptables,
    ports: Vec<Port>,
}

impl Firewall {
    /// Builds the firewall for a container id, bind address and port set.
    pub fn new(container_id: &str, address: &str, ports: Vec<Port>) -> Result<Self> {
        Ok(Self {
            chain: format!("{}{}", config::NAME_PREFIX, container_id),
            address: address.to_string(),
            ipt: Iptables::for_address(address)?,
            ports,
        })
    }

    /// Builds a rule-less firewall for chain teardown. Discovered
    /// containers may carry no usable bind address; teardown then falls
    /// back to the IPv4 binary, which is where such chains live.
    pub fn for_teardown(container_id: &str, address: &str) -> Self {
        let ipt = Iptables::for_address(address).unwrap_or(Iptables {
            program: config::IPTABLES_PATH,
        });
        Self {
            chain: format!("{}{}", config::NAME_PREFIX, container_id),
            address: address.to_string(),
            ipt,
            ports: Vec::new(),
        }
    }

    /// Installs or refreshes the per-container chain.
    pub async fn install(&self) -> Result<()> {
        if config::skip_iptables() {
            tracing::debug!("SKIP_IPTABLES set, not installing chain {}", self.chain);
            return Ok(());
        }
        tracing::info!("installing chain {}", self.chain);
        self.ensure_parent().await?;
        self.ensure_chain().await?;
        self.ipt.flush_chain(TABLE, &self.chain).await?;
        for port in &self.ports {
            for rule in port_rules(&self.address, port) {
                self.ipt
                    .append_unique(TABLE, &self.chain, &rule)
                    .await
                    .with_context(|| format!("securing port {}", port.port))?;
            }
        }
        Ok(())
    }

    /// Removes the jump and the per-container chain. The parent chain is
    /// left in place.
    pub async fn uninstall(&self) -> Result<()> {
        if config::skip_iptables() {
            tracing::debug!("SKIP_IPTABLES set, not uninstalling chain {}", self.chain);
            return Ok(());
        }
        tracing::info!("uninstalling chain {}", self.chain);
        self.ipt
            .delete_if_exists(TABLE, PARENT_CHAIN, &svec(&["-j", &self.chain]))
            .await
            .context("removing jump from parent chain")?;
        if self.ipt.chain_exists(TABLE, &self.chain).await? {
            self.ipt
                .clear_and_delete_chain(TABLE, &self.chain)
                .await
                .context("deleting container chain")?;
        }
        Ok(())
    }

    /// Creates the parent chain and hooks it ahead of the runtime's rules.
    async fn ensure_parent(&self) -> Result<()> {
        if !self.ipt.chain_exists(TABLE, PARENT_CHAIN).await? {
            self.ipt.new_chain(TABLE, PARENT_CHAIN).await?;
        }
        self.ipt
            .insert_unique(TABLE, DOCKER_USER, 1, &svec(&["-j", PARENT_CHAIN]))
            .await
            .context("hooking parent chain into DOCKER-USER")
    }

    async fn ensure_chain(&self) -> Result<()> {
        if !self.ipt.chain_exists(TABLE, &self.chain).await? {
            self.ipt.new_chain(TABLE, &self.chain).await?;
        }
        self.ipt
            .append_unique(TABLE, PARENT_CHAIN, &svec(&["-j", &self.chain]))
            .await
    }
}

/// Generates the rule argument vectors for one port.
///
/// Remote-specific matches first, jumping to the port policy; then the
/// per-protocol catch-alls jumping to the complement.
fn port_rules(address: &str, port: &Port) -> Vec<Vec<String>> {
    let unmatched = port.policy.complement();
    let port_str = port.port.to_string();
    let mut rules = Vec::new();
    for remote in &port.remotes {
        for proto in PROTOCOLS {
            rules.push(svec(&[
                "-p",
                proto,
                "-m",
                "conntrack",
                "--ctorigsrc",
                remote,
                "--ctorigdst",
                address,
                "--ctorigdstport",
                &port_str,
                "-j",
                port.policy.as_str(),
            ]));
        }
    }
    for proto in PROTOCOLS {
        rules.push(svec(&[
            "-p",
            proto,
            "-m",
            "conntrack",
            "--ctorigdst",
            address,
            "--ctorigdstport",
            &port_str,
            "-j",
            unmatched.as_str(),
        ]));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_port(port: u16, remotes: &[&str]) -> Port {
        Port {
            port,
            policy: Policy::Accept,
            remotes: remotes.iter().map(|r| r.to_string()).collect(),
        }
    }

    // =========================================================================
    // Rule generation
    // =========================================================================

    #[test]
    fn test_allowlist_rules() {
        let port = accept_port(80, &["10.0.0.0/8"]);
        let rules = port_rules("1.2.3.4", &port);

        // One remote times two protocols, plus two catch-alls.
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0],
            svec(&[
                "-p", "tcp", "-m", "conntrack", "--ctorigsrc", "10.0.0.0/8", "--ctorigdst",
                "1.2.3.4", "--ctorigdstport", "80", "-j", "ACCEPT",
            ])
        );
        assert_eq!(rules[1][1], "udp");
        assert_eq!(rules[1].last().unwrap(), "ACCEPT");
        // Catch-alls drop everyone else.
        assert_eq!(
            rules[2],
            svec(&[
                "-p", "tcp", "-m", "conntrack", "--ctorigdst", "1.2.3.4", "--ctorigdstport",
                "80", "-j", "DROP",
            ])
        );
        assert_eq!(rules[3][1], "udp");
        assert_eq!(rules[3].last().unwrap(), "DROP");
    }

    #[test]
    fn test_denylist_rules() {
        let port = Port {
            port: 25565,
            policy: Policy::Drop,
            remotes: vec!["203.0.113.0/24".to_string()],
        };
        let rules = port_rules("5.6.7.8", &port);

        assert_eq!(rules.len(), 4);
        // Remote matches are dropped, everyone else accepted.
        assert_eq!(rules[0].last().unwrap(), "DROP");
        assert_eq!(rules[1].last().unwrap(), "DROP");
        assert_eq!(rules[2].last().unwrap(), "ACCEPT");
        assert_eq!(rules[3].last().unwrap(), "ACCEPT");
    }

    #[test]
    fn test_empty_remotes_yields_only_catchalls() {
        let port = accept_port(443, &[]);
        let rules = port_rules("1.2.3.4", &port);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.last().unwrap() == "DROP"));
    }

    #[test]
    fn test_remote_rules_precede_catchalls() {
        let port = accept_port(80, &["10.0.0.0/8", "192.0.2.0/24"]);
        let rules = port_rules("1.2.3.4", &port);
        assert_eq!(rules.len(), 6);
        assert!(rules[..4].iter().all(|r| r.contains(&"--ctorigsrc".to_string())));
        assert!(!rules[4].contains(&"--ctorigsrc".to_string()));
    }

    // =========================================================================
    // Family selection and naming
    // =========================================================================

    #[test]
    fn test_family_program_selection() {
        assert_eq!(
            family_program(&"1.2.3.4".parse().unwrap()),
            config::IPTABLES_PATH
        );
        assert_eq!(
            family_program(&"2001:db8::1".parse().unwrap()),
            config::IP6TABLES_PATH
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = Iptables::for_address("not-an-ip").unwrap_err();
        assert_eq!(err.to_string(), "invalid address");
    }

    #[test]
    fn test_chain_name() {
        let fw = Firewall::new("x", "1.2.3.4", Vec::new()).unwrap();
        assert_eq!(fw.chain, "sb-x");
    }
}
