use crate::network::{FirewallRule, NetworkOps};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Tap,
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub addrs: Vec<Ipv4Addr>,
    pub up: bool,
    pub master: Option<String>,
}

impl FakeLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            addrs: Vec::new(),
            up: false,
            master: None,
        }
    }
}

/// What the fake host's network looks like right now.
#[derive(Debug, Clone)]
pub struct NetState {
    pub links: BTreeMap<String, FakeLink>,
    pub ip_forward: bool,
    pub rules: Vec<FirewallRule>,
    pub default_route: Option<String>,
}

impl NetState {
    fn links_of(&self, kind: LinkKind) -> Vec<String> {
        self.links
            .iter()
            .filter(|(_, link)| link.kind == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn bridges(&self) -> Vec<String> {
        self.links_of(LinkKind::Bridge)
    }

    pub fn taps(&self) -> Vec<String> {
        self.links_of(LinkKind::Tap)
    }
}

/// In-memory [`NetworkOps`] that behaves like `ip`/`iptables` on a fresh host:
/// adding something that exists fails, touching something missing fails.
pub struct FakeNetwork {
    state: Mutex<NetState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NetState {
                links: BTreeMap::new(),
                ip_forward: false,
                rules: Vec::new(),
                default_route: Some("eth0".to_string()),
            }),
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn snapshot(&self) -> NetState {
        self.state.lock().unwrap().clone()
    }

    /// Number of times `op` (a [`NetworkOps`] method name) was called.
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Make every later call to `op` fail until [`FakeNetwork::heal`].
    pub fn fail(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.failing.lock().unwrap().remove(op);
    }

    pub fn add_existing_bridge(&self, name: &str, addrs: &[Ipv4Addr]) {
        let mut link = FakeLink::new(LinkKind::Bridge);
        link.addrs = addrs.to_vec();
        self.state
            .lock()
            .unwrap()
            .links
            .insert(name.to_string(), link);
    }

    pub fn add_existing_tap(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Tap));
    }

    pub fn set_default_route(&self, iface: &str) {
        self.state.lock().unwrap().default_route = Some(iface.to_string());
    }

    pub fn clear_default_route(&self) {
        self.state.lock().unwrap().default_route = None;
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        if self.failing.lock().unwrap().contains(op) {
            bail!("injected failure in {op}");
        }
        Ok(())
    }

    fn create_link(&self, name: &str, kind: LinkKind) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(name) {
            bail!("RTNETLINK answers: File exists ({name})");
        }
        state.links.insert(name.to_string(), FakeLink::new(kind));
        Ok(())
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut FakeLink) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| anyhow!("Device \"{name}\" does not exist."))?;
        f(link)
    }
}

#[async_trait]
impl NetworkOps for FakeNetwork {
    async fn link_exists(&self, name: &str) -> Result<bool> {
        self.enter("link_exists")?;
        Ok(self.state.lock().unwrap().links.contains_key(name))
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        self.enter("create_bridge")?;
        self.create_link(name, LinkKind::Bridge)
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        self.enter("create_tap")?;
        self.create_link(name, LinkKind::Tap)
    }

    async fn delete_link(&self, name: &str) -> Result<bool> {
        self.enter("delete_link")?;
        Ok(self.state.lock().unwrap().links.remove(name).is_some())
    }

    async fn ipv4_addrs(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        self.enter("ipv4_addrs")?;
        self.with_link(name, |link| Ok(link.addrs.clone()))
    }

    async fn add_addr(&self, name: &str, cidr: &str) -> Result<()> {
        self.enter("add_addr")?;
        let addr: Ipv4Addr = cidr
            .split('/')
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| anyhow!("invalid address {cidr}"))?;
        self.with_link(name, |link| {
            if link.addrs.contains(&addr) {
                bail!("RTNETLINK answers: File exists ({cidr})");
            }
            link.addrs.push(addr);
            Ok(())
        })
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        self.enter("set_up")?;
        self.with_link(name, |link| {
            link.up = true;
            Ok(())
        })
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<()> {
        self.enter("set_master")?;
        let is_bridge = self
            .state
            .lock()
            .unwrap()
            .links
            .get(bridge)
            .is_some_and(|l| l.kind == LinkKind::Bridge);
        if !is_bridge {
            bail!("Device \"{bridge}\" is not a bridge");
        }
        self.with_link(name, |link| {
            link.master = Some(bridge.to_string());
            Ok(())
        })
    }

    async fn enable_ip_forwarding(&self) -> Result<()> {
        self.enter("enable_ip_forwarding")?;
        self.state.lock().unwrap().ip_forward = true;
        Ok(())
    }

    async fn default_route_interface(&self) -> Result<String> {
        self.enter("default_route_interface")?;
        self.state
            .lock()
            .unwrap()
            .default_route
            .clone()
            .ok_or_else(|| anyhow!("No default route found"))
    }

    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        self.enter("rule_exists")?;
        Ok(self.state.lock().unwrap().rules.contains(rule))
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.enter("append_rule")?;
        // iptables -A happily appends duplicates.
        self.state.lock().unwrap().rules.push(rule.clone());
        Ok(())
    }
}
