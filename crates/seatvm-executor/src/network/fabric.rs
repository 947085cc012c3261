use super::{FirewallRule, NetworkOps};
use crate::config::FabricConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// The shared bridge every seat's tap hangs off, plus NAT out of the uplink.
///
/// Setup runs on every create and converges: nothing is added twice and an
/// already-configured host is left untouched.
#[derive(Clone)]
pub struct NetworkFabric {
    ops: Arc<dyn NetworkOps>,
    config: FabricConfig,
    /// iptables has no atomic check-and-append, so setup runs one at a time.
    setup_lock: Arc<Mutex<()>>,
}

impl NetworkFabric {
    pub fn new(ops: Arc<dyn NetworkOps>, config: FabricConfig) -> Self {
        Self {
            ops,
            config,
            setup_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Make sure the bridge exists, carries the gateway address, is up, and NATs.
    #[instrument(skip(self), fields(bridge = %self.config.bridge_name))]
    pub async fn ensure_bridge(&self) -> Result<()> {
        let _guard = self.setup_lock.lock().await;
        let bridge = &self.config.bridge_name;

        if !self.ops.link_exists(bridge).await? {
            info!("Creating bridge {}", bridge);
            if let Err(e) = self.ops.create_bridge(bridge).await {
                // Someone else may have created it between the check and the add.
                if !self.ops.link_exists(bridge).await? {
                    return Err(e);
                }
                warn!(error = %e, "Bridge appeared concurrently, continuing");
            }
        }

        // Compare by address: re-adding one that is present fails with EEXIST.
        let addrs = self
            .ops
            .ipv4_addrs(bridge)
            .await
            .with_context(|| format!("Failed to read addresses of {bridge}"))?;
        if addrs.contains(&self.config.gateway) {
            debug!(gateway = %self.config.gateway, "Bridge address already assigned");
        } else {
            self.ops.add_addr(bridge, &self.config.bridge_cidr()).await?;
        }

        self.ops.set_up(bridge).await?;

        self.install_nat().await?;
        Ok(())
    }

    /// Enable forwarding and install masquerade plus forward rules. Returns the uplink.
    #[instrument(skip(self))]
    pub async fn ensure_nat(&self) -> Result<String> {
        let _guard = self.setup_lock.lock().await;
        self.install_nat().await
    }

    async fn install_nat(&self) -> Result<String> {
        self.ops.enable_ip_forwarding().await?;

        let uplink = match &self.config.uplink {
            Some(uplink) => uplink.clone(),
            None => self.ops.default_route_interface().await?,
        };

        for rule in self.nat_rules(&uplink) {
            if self.ops.rule_exists(&rule).await? {
                debug!(%rule, "Firewall rule already present");
                continue;
            }
            info!(%rule, "Adding firewall rule");
            self.ops.append_rule(&rule).await?;
        }

        Ok(uplink)
    }

    pub fn nat_rules(&self, uplink: &str) -> Vec<FirewallRule> {
        let bridge = self.config.bridge_name.as_str();
        let subnet = self.config.subnet_cidr();
        vec![
            FirewallRule::new(
                "nat",
                "POSTROUTING",
                &["-s", subnet.as_str(), "-o", uplink, "-j", "MASQUERADE"],
            ),
            FirewallRule::new("filter", "FORWARD", &["-i", bridge, "-o", uplink, "-j", "ACCEPT"]),
            FirewallRule::new(
                "filter",
                "FORWARD",
                &[
                    "-i",
                    uplink,
                    "-o",
                    bridge,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeNetwork;
    use std::net::Ipv4Addr;

    fn fabric(net: &Arc<FakeNetwork>) -> NetworkFabric {
        NetworkFabric::new(net.clone(), FabricConfig::default())
    }

    #[tokio::test]
    async fn test_ensure_bridge_is_idempotent() {
        let net = Arc::new(FakeNetwork::new());
        let fabric = fabric(&net);

        for _ in 0..5 {
            fabric.ensure_bridge().await.unwrap();
        }

        let state = net.snapshot();
        assert_eq!(state.bridges(), vec!["seatbr0".to_string()]);
        assert_eq!(
            state.links["seatbr0"].addrs,
            vec![Ipv4Addr::new(192, 168, 100, 1)]
        );
        assert!(state.links["seatbr0"].up);
        assert!(state.ip_forward);
        assert_eq!(state.rules.len(), 3);
        assert_eq!(net.calls("create_bridge"), 1);
        assert_eq!(net.calls("add_addr"), 1);
        assert_eq!(net.calls("append_rule"), 3);
    }

    #[tokio::test]
    async fn test_existing_address_is_not_readded() {
        let net = Arc::new(FakeNetwork::new());
        net.add_existing_bridge("seatbr0", &[Ipv4Addr::new(192, 168, 100, 1)]);

        fabric(&net).ensure_bridge().await.unwrap();

        assert_eq!(net.calls("create_bridge"), 0);
        assert_eq!(net.calls("add_addr"), 0);
    }

    #[tokio::test]
    async fn test_nat_uses_default_route_uplink() {
        let net = Arc::new(FakeNetwork::new());
        net.set_default_route("ens5");
        let fabric = fabric(&net);

        let uplink = fabric.ensure_nat().await.unwrap();
        assert_eq!(uplink, "ens5");

        let rules = net.snapshot().rules;
        assert!(rules.iter().any(|r| r.table == "nat"
            && r.spec.contains(&"MASQUERADE".to_string())
            && r.spec.contains(&"ens5".to_string())));
        assert!(rules
            .iter()
            .any(|r| r.spec.contains(&"RELATED,ESTABLISHED".to_string())));
    }

    #[tokio::test]
    async fn test_configured_uplink_skips_detection() {
        let net = Arc::new(FakeNetwork::new());
        let config = FabricConfig {
            uplink: Some("eth9".to_string()),
            ..FabricConfig::default()
        };
        let uplink = NetworkFabric::new(net.clone(), config)
            .ensure_nat()
            .await
            .unwrap();
        assert_eq!(uplink, "eth9");
        assert_eq!(net.calls("default_route_interface"), 0);
    }

    #[tokio::test]
    async fn test_bridge_creation_failure_is_fatal() {
        let net = Arc::new(FakeNetwork::new());
        let fabric = fabric(&net);
        net.fail("create_bridge");
        assert!(fabric.ensure_bridge().await.is_err());
        assert!(net.snapshot().rules.is_empty());

        // Nothing half-built blocks the next attempt.
        net.heal("create_bridge");
        fabric.ensure_bridge().await.unwrap();
        assert_eq!(net.snapshot().bridges(), vec!["seatbr0".to_string()]);
        assert_eq!(net.snapshot().rules.len(), 3);
    }

    #[tokio::test]
    async fn test_nat_without_default_route_fails() {
        let net = Arc::new(FakeNetwork::new());
        net.clear_default_route();
        let fabric = fabric(&net);

        let err = fabric.ensure_nat().await.unwrap_err();
        assert!(err.to_string().contains("default route"), "{err}");
        assert!(fabric.ensure_bridge().await.is_err());
        assert!(net.snapshot().rules.is_empty());
        assert_eq!(net.calls("append_rule"), 0);

        net.set_default_route("ens5");
        assert_eq!(fabric.ensure_nat().await.unwrap(), "ens5");
        assert_eq!(net.snapshot().rules.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_setup_converges() {
        let net = Arc::new(FakeNetwork::new());
        let fabric = fabric(&net);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fabric = fabric.clone();
            handles.push(tokio::spawn(async move { fabric.ensure_bridge().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = net.snapshot();
        assert_eq!(state.bridges().len(), 1);
        assert_eq!(state.links["seatbr0"].addrs.len(), 1);
        assert_eq!(state.rules.len(), 3);
    }
}
