//! Kernel command line networking contract between the host and the guest init.
//!
//! The host emits a single `ip=` token in the classic kernel nfsroot format:
//!
//! ```text
//! ip=<client-ip>:<server-ip>:<gateway-ip>:<netmask>:<hostname>:<device>:<autoconf>
//! ```
//!
//! The guest init reads it back by fixed field position. Both sides go through
//! this module so the field order cannot drift.

use std::net::Ipv4Addr;

/// Name of the guest NIC the host attaches the tap to.
pub const GUEST_DEVICE: &str = "eth0";
pub const AUTOCONF_OFF: &str = "off";
pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Used by the guest when the command line carries no `ip=` token.
pub const FALLBACK_CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 2);
pub const FALLBACK_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 1);

const IP_TOKEN_PREFIX: &str = "ip=";

const FIELD_CLIENT: usize = 0;
const FIELD_GATEWAY: usize = 2;
const FIELD_NETMASK: usize = 3;
const FIELD_DEVICE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootNetwork {
    pub client_ip: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub device: String,
}

impl BootNetwork {
    pub fn new(client_ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            client_ip,
            gateway: Some(gateway),
            netmask,
            device: GUEST_DEVICE.to_string(),
        }
    }

    pub fn fallback() -> Self {
        Self::new(FALLBACK_CLIENT_IP, FALLBACK_GATEWAY, DEFAULT_NETMASK)
    }

    /// Render the `ip=` kernel parameter. Server and hostname stay empty.
    pub fn to_kernel_arg(&self) -> String {
        let gateway = self.gateway.map(|g| g.to_string()).unwrap_or_default();
        format!(
            "{IP_TOKEN_PREFIX}{}::{}:{}::{}:{AUTOCONF_OFF}",
            self.client_ip, gateway, self.netmask, self.device
        )
    }

    /// Extract the network settings from a full kernel command line.
    ///
    /// Returns `None` when there is no `ip=` token or its client field is not an
    /// IPv4 address. If the token appears more than once the last one wins, the
    /// same as the kernel's own parameter handling. Empty gateway means no default
    /// route; empty netmask and device fall back to `/24` and `eth0`.
    pub fn from_cmdline(cmdline: &str) -> Option<Self> {
        let value = cmdline
            .split_whitespace()
            .filter_map(|token| token.strip_prefix(IP_TOKEN_PREFIX))
            .last()?;

        let fields: Vec<&str> = value.split(':').collect();
        let field = |idx: usize| fields.get(idx).copied().filter(|f| !f.is_empty());

        let client_ip = field(FIELD_CLIENT)?.parse().ok()?;
        let gateway = field(FIELD_GATEWAY).and_then(|g| g.parse().ok());
        let netmask = field(FIELD_NETMASK)
            .and_then(|m| m.parse().ok())
            .unwrap_or(DEFAULT_NETMASK);
        let device = field(FIELD_DEVICE).unwrap_or(GUEST_DEVICE).to_string();

        Some(Self {
            client_ip,
            gateway,
            netmask,
            device,
        })
    }

    pub fn from_cmdline_or_fallback(cmdline: &str) -> Self {
        Self::from_cmdline(cmdline).unwrap_or_else(Self::fallback)
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }

    /// `a.b.c.d/nn` form understood by `ip addr add`.
    pub fn client_cidr(&self) -> String {
        format!("{}/{}", self.client_ip, self.prefix_len())
    }
}

/// Full kernel command line for a guest: the base args, the init override, then the network token.
pub fn kernel_cmdline(base_args: &str, init_path: &str, net: &BootNetwork) -> String {
    let mut parts: Vec<String> = base_args.split_whitespace().map(str::to_string).collect();
    parts.push(format!("init={init_path}"));
    parts.push(net.to_kernel_arg());
    parts.join(" ")
}
