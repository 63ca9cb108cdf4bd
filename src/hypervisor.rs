//! The libvirt collaborator boundary.
//!
//! Everything the orchestrator needs from the hypervisor is expressed as the
//! [`Hypervisor`] trait; [`Virsh`] is the production implementation that
//! shells out to `virsh` via `tokio::process::Command`. The controller and
//! preflight validator are generic over the trait so scenario tests can
//! drive them with a scripted fake.
//!
//! Domain state is always a live query. Nothing here caches.

use std::process::Output;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

/// Observed lifecycle state of the libvirt domain.
///
/// `Unknown` covers both a state string we do not recognise and a domain
/// libvirt cannot find; the orchestrator treats the two identically (the
/// domain definition is a precondition owned elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    Running,
    ShutOff,
    Paused,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Parse `virsh domstate` output.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => Self::Running,
            "shut off" => Self::ShutOff,
            "paused" => Self::Paused,
            "pmsuspended" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::ShutOff => "shut off",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Hypervisor operations the orchestrator consumes, by contract only.
#[allow(async_fn_in_trait)]
pub trait Hypervisor {
    /// Live state of the domain. A domain libvirt does not know about
    /// reports `Unknown` rather than an error.
    async fn domain_state(&self, name: &str) -> Result<DomainState>;

    /// Issue a domain start. An "already active" refusal is an error here;
    /// callers decide whether that matters.
    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Request an orderly in-guest shutdown. Completion is observed by
    /// polling [`domain_state`](Self::domain_state), not by this call.
    async fn graceful_shutdown(&self, name: &str) -> Result<()>;

    /// Hard-terminate the domain. Destroying a domain that is not running
    /// must be a harmless no-op, never an error.
    async fn force_destroy(&self, name: &str) -> Result<()>;

    /// Resume a paused domain.
    async fn resume(&self, name: &str) -> Result<()>;

    /// Guest address, if one has been assigned yet.
    async fn guest_address(&self, name: &str) -> Result<Option<String>>;

    /// Whether the named libvirt network is defined and active.
    async fn network_active(&self, network: &str) -> Result<bool>;

    /// Start an inactive libvirt network.
    async fn start_network(&self, network: &str) -> Result<()>;
}

/// Production implementation shelling out to `virsh`.
#[derive(Debug, Clone, Default)]
pub struct Virsh {
    /// Optional `--connect` URI; `None` uses virsh's default
    /// (`qemu:///system` when running as root).
    pub connect_uri: Option<String>,
}

impl Virsh {
    async fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.connect_uri {
            cmd.arg("--connect").arg(uri);
        }
        cmd.args(args);

        debug!(?args, "virsh");
        cmd.output()
            .await
            .with_context(|| format!("failed to spawn virsh {}", args.join(" ")))
    }

    /// Run virsh and turn a non-zero exit into an error carrying stderr.
    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "virsh {} failed (exit {}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )
        }
    }
}

/// Pick the first IPv4 address out of `virsh domifaddr` output.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------
///  vnet0      52:54:00:3c:5e:12    ipv4         192.168.122.41/24
/// ```
pub(crate) fn parse_domifaddr(raw: &str) -> Option<String> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _name = fields.next()?;
            let _mac = fields.next()?;
            let proto = fields.next()?;
            let addr = fields.next()?;
            (proto == "ipv4").then(|| addr.split('/').next().unwrap_or(addr).to_string())
        })
        .next()
}

/// Pick the `Active:` field out of `virsh net-info` output.
pub(crate) fn parse_net_active(raw: &str) -> bool {
    raw.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("Active:") && fields.next() == Some("yes")
    })
}

impl Hypervisor for Virsh {
    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let output = self.run(&["domstate", name]).await?;
        if !output.status.success() {
            // "failed to get domain" — the domain is not defined right now.
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(domain = name, stderr = %stderr.trim(), "domstate query failed");
            return Ok(DomainState::Unknown);
        }
        Ok(DomainState::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run_checked(&["start", name]).await
    }

    async fn graceful_shutdown(&self, name: &str) -> Result<()> {
        self.run_checked(&["shutdown", name]).await
    }

    async fn force_destroy(&self, name: &str) -> Result<()> {
        let output = self.run(&["destroy", name]).await?;
        if output.status.success() {
            return Ok(());
        }

        // Destroying an already-stopped or undefined domain is the expected
        // no-op during cleanup, not a failure.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.contains("domain is not running") || stderr.contains("failed to get domain") {
            debug!(domain = name, "destroy was a no-op");
            Ok(())
        } else {
            anyhow::bail!("virsh destroy {name} failed: {stderr}")
        }
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.run_checked(&["resume", name]).await
    }

    async fn guest_address(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["domifaddr", name]).await?;
        if !output.status.success() {
            // Address resolution is best-effort; a guest without the agent
            // or lease yet simply has no address to report.
            return Ok(None);
        }
        Ok(parse_domifaddr(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn network_active(&self, network: &str) -> Result<bool> {
        let output = self.run(&["net-info", network]).await?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(parse_net_active(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn start_network(&self, network: &str) -> Result<()> {
        self.run_checked(&["net-start", network]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domstate_strings_map_to_states() {
        assert_eq!(DomainState::parse("running\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off\n"), DomainState::ShutOff);
        assert_eq!(DomainState::parse("paused\n"), DomainState::Paused);
        assert_eq!(DomainState::parse("pmsuspended\n"), DomainState::Suspended);
        assert_eq!(DomainState::parse("in shutdown\n"), DomainState::Unknown);
        assert_eq!(DomainState::parse(""), DomainState::Unknown);
    }

    #[test]
    fn domifaddr_yields_first_ipv4_without_prefix() {
        let raw = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
 vnet0      52:54:00:3c:5e:12    ipv4         192.168.122.41/24
";
        assert_eq!(parse_domifaddr(raw).as_deref(), Some("192.168.122.41"));
    }

    #[test]
    fn domifaddr_skips_ipv6_rows() {
        let raw = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
 vnet0      52:54:00:3c:5e:12    ipv6         fe80::1/64
 vnet0      52:54:00:3c:5e:12    ipv4         10.0.0.7/24
";
        assert_eq!(parse_domifaddr(raw).as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn domifaddr_with_no_lease_is_none() {
        let raw = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
";
        assert_eq!(parse_domifaddr(raw), None);
    }

    #[test]
    fn net_info_active_field_is_detected() {
        let active = "Name:           default\nUUID:           x\nActive:         yes\n";
        let inactive = "Name:           default\nActive:         no\n";
        assert!(parse_net_active(active));
        assert!(!parse_net_active(inactive));
    }
}
