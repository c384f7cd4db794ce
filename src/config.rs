//! Environment variables and fixed host paths.
//!
//! The supervisor is configured entirely through the environment; there is
//! no config file. Paths below are fixed by the deployment image: the agent
//! runs inside a container named `serverbench` that bind-mounts the host's
//! container-data root at `/containers`.

use anyhow::Result;

/// Primary environment variable for the machine secret.
pub const SERVERBENCH_KEY: &str = "SERVERBENCH_KEY";

/// Fallback environment variable for the machine secret.
pub const KEY: &str = "KEY";

/// Environment variable overriding the control-plane endpoint URL.
pub const ENDPOINT: &str = "ENDPOINT";

/// Default control-plane endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://stream.beta.serverbench.io";

/// Container data root on the agent side of the bind mount.
pub const CONTAINERS_ROOT: &str = "/containers";

/// Root under which per-container system users get their homes.
pub const USERS_ROOT: &str = "/users";

/// Path wrapper for the IPv4 filter binary.
pub const IPTABLES_PATH: &str = "/wrapper/iptables";

/// Path wrapper for the IPv6 filter binary.
pub const IP6TABLES_PATH: &str = "/wrapper/ip6tables";

/// Host network namespace, reserved for out-of-band invocations.
#[allow(dead_code)]
pub const HOST_NETNS: &str = "/mnt/host_netns";

/// Name prefix for managed containers.
pub const NAME_PREFIX: &str = "sb-";

/// Runtime-side name prefix (Docker prepends a slash).
pub const RUNTIME_NAME_PREFIX: &str = "/sb-";

/// Runtime name of the agent's own container.
pub const SELF_CONTAINER: &str = "serverbench";

/// Supplementary group shared by all container users.
pub const GROUP: &str = "serverbench";

/// Reads the machine secret from `SERVERBENCH_KEY`, falling back to `KEY`.
pub fn machine_key() -> Result<String> {
    std::env::var(SERVERBENCH_KEY)
        .or_else(|_| std::env::var(KEY))
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow::anyhow!("serverbench key not found"))
}

/// Returns the control-plane endpoint, honoring the `ENDPOINT` override.
pub fn endpoint() -> String {
    std::env::var(ENDPOINT)
        .ok()
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Whether all firewall operations are disabled (`SKIP_IPTABLES=true`).
pub fn skip_iptables() -> bool {
    flag("SKIP_IPTABLES")
}

/// Whether data-directory cleanup on destroy is disabled (`SKIP_CLEAN=true`).
pub fn skip_clean() -> bool {
    flag("SKIP_CLEAN")
}

/// Whether a synthetic interface is returned when no public one exists
/// (`TEST_ETH0=true`).
pub fn test_eth0() -> bool {
    flag("TEST_ETH0")
}
