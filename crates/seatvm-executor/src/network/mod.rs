//! Host networking for microVM seats: the shared bridge, NAT, and per-seat taps.

pub mod fabric;
pub mod tap;

pub use fabric::NetworkFabric;
pub use tap::TapManager;

use crate::command;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
const ROUTE_TABLE_PATH: &str = "/proc/net/route";

/// One iptables rule, addressed by table and chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

impl FirewallRule {
    pub fn new(table: &str, chain: &str, spec: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.clone(),
            action.to_string(),
            self.chain.clone(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// The OS networking primitives the fabric and tap manager are built from.
///
/// Every mutating call is a single step; idempotency is the caller's job and is
/// built from the query methods.
#[async_trait]
pub trait NetworkOps: Send + Sync {
    async fn link_exists(&self, name: &str) -> Result<bool>;

    async fn create_bridge(&self, name: &str) -> Result<()>;

    async fn create_tap(&self, name: &str) -> Result<()>;

    /// Returns `false` when there was nothing to delete.
    async fn delete_link(&self, name: &str) -> Result<bool>;

    async fn ipv4_addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    async fn add_addr(&self, name: &str, cidr: &str) -> Result<()>;

    async fn set_up(&self, name: &str) -> Result<()>;

    async fn set_master(&self, name: &str, bridge: &str) -> Result<()>;

    async fn enable_ip_forwarding(&self) -> Result<()>;

    /// Interface carrying the host's default route.
    async fn default_route_interface(&self) -> Result<String>;

    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool>;

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()>;
}

/// [`NetworkOps`] backed by the `ip` and `iptables` tools and procfs.
#[derive(Debug, Clone, Default)]
pub struct IpCommand;

impl IpCommand {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkOps for IpCommand {
    async fn link_exists(&self, name: &str) -> Result<bool> {
        let out = command::output("ip", ["link", "show", "dev", name]).await?;
        Ok(out.status.success())
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        command::run("ip", ["link", "add", "name", name, "type", "bridge"])
            .await
            .with_context(|| format!("Failed to create bridge {name}"))?;
        Ok(())
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        command::run("ip", ["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .with_context(|| format!("Failed to create TAP device {name}"))?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<bool> {
        if !self.link_exists(name).await? {
            return Ok(false);
        }
        if let Err(e) = command::run("ip", ["link", "del", "dev", name]).await {
            // Lost a race with another deleter.
            if !self.link_exists(name).await? {
                return Ok(false);
            }
            return Err(e.context(format!("Failed to delete link {name}")));
        }
        Ok(true)
    }

    async fn ipv4_addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let out = command::run("ip", ["-o", "-4", "addr", "show", "dev", name]).await?;
        Ok(parse_ipv4_addrs(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn add_addr(&self, name: &str, cidr: &str) -> Result<()> {
        command::run("ip", ["addr", "add", cidr, "dev", name])
            .await
            .with_context(|| format!("Failed to add {cidr} to {name}"))?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        command::run("ip", ["link", "set", "dev", name, "up"])
            .await
            .with_context(|| format!("Failed to bring up {name}"))?;
        Ok(())
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<()> {
        command::run("ip", ["link", "set", "dev", name, "master", bridge])
            .await
            .with_context(|| format!("Failed to attach {name} to {bridge}"))?;
        Ok(())
    }

    async fn enable_ip_forwarding(&self) -> Result<()> {
        tokio::fs::write(IP_FORWARD_PATH, "1")
            .await
            .context("Failed to enable IPv4 forwarding")
    }

    async fn default_route_interface(&self) -> Result<String> {
        let table = tokio::fs::read_to_string(ROUTE_TABLE_PATH)
            .await
            .context("Failed to read routing table")?;
        parse_default_route(&table).context("No default route found")
    }

    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        let out = command::output("iptables", rule.args("-C")).await?;
        debug!(%rule, exists = out.status.success(), "Checked firewall rule");
        Ok(out.status.success())
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        command::run("iptables", rule.args("-A"))
            .await
            .with_context(|| format!("Failed to add firewall rule {rule}"))?;
        Ok(())
    }
}

/// Pull the addresses out of `ip -o -4 addr show` output.
pub fn parse_ipv4_addrs(output: &str) -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token != "inet" {
                continue;
            }
            if let Some(addr) = tokens
                .next()
                .and_then(|cidr| cidr.split('/').next())
                .and_then(|a| a.parse().ok())
            {
                addrs.push(addr);
            }
        }
    }
    addrs
}

/// First interface in `/proc/net/route` whose destination and mask are both zero.
pub fn parse_default_route(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let iface = fields.first()?;
        let destination = fields.get(1)?;
        let mask = fields.get(7).copied().unwrap_or("00000000");
        (*destination == "00000000" && mask == "00000000").then(|| iface.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
seatbr0\t0064A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
ens5\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
";

    #[test]
    fn test_parse_default_route_takes_first_match() {
        assert_eq!(parse_default_route(ROUTES), Some("ens5".to_string()));
    }

    #[test]
    fn test_parse_default_route_none() {
        let table = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask
lo\t0000007F\t00000000\t0001\t0\t0\t0\t000000FF
";
        assert_eq!(parse_default_route(table), None);
        assert_eq!(parse_default_route(""), None);
    }

    #[test]
    fn test_parse_ipv4_addrs() {
        let out = "5: seatbr0    inet 192.168.100.1/24 brd 192.168.100.255 scope global seatbr0\\       valid_lft forever preferred_lft forever
5: seatbr0    inet 10.1.0.1/16 scope global secondary seatbr0\\       valid_lft forever preferred_lft forever
";
        assert_eq!(
            parse_ipv4_addrs(out),
            vec![Ipv4Addr::new(192, 168, 100, 1), Ipv4Addr::new(10, 1, 0, 1)]
        );
        assert!(parse_ipv4_addrs("").is_empty());
    }

    #[test]
    fn test_rule_args() {
        let rule = FirewallRule::new("nat", "POSTROUTING", &["-o", "ens5", "-j", "MASQUERADE"]);
        assert_eq!(
            rule.args("-C"),
            vec!["-t", "nat", "-C", "POSTROUTING", "-o", "ens5", "-j", "MASQUERADE"]
        );
        assert_eq!(rule.to_string(), "-t nat POSTROUTING -o ens5 -j MASQUERADE");
    }
}
