//! Host configuration: defaults, YAML file, then `SEATVM_*` environment overrides.

use crate::addressing;
use crate::rootfs::{ImageBuildConfig, InitSource};
use seatvm_common::{Result, SeatError, VmSizing};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "SEATVM_CONFIG";
pub const BUILD_CONFIG_PATH_ENV: &str = "SEATVM_BUILD_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub fabric: FabricConfig,
    pub vm: VmDefaults,
    pub paths: PathsConfig,
    pub container: ContainerConfig,
}

/// Shared bridge and NAT settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub bridge_name: String,
    /// Bridge address, also the guests' default gateway.
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    /// Skip default-route detection and NAT out of this interface.
    pub uplink: Option<String>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bridge_name: "seatbr0".to_string(),
            gateway: Ipv4Addr::new(192, 168, 100, 1),
            prefix_len: 24,
            uplink: None,
        }
    }
}

impl FabricConfig {
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32u32.saturating_sub(u32::from(self.prefix_len)))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway) & u32::from(self.netmask()))
    }

    /// `192.168.100.1/24`
    pub fn bridge_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.prefix_len)
    }

    /// `192.168.100.0/24`
    pub fn subnet_cidr(&self) -> String {
        format!("{}/{}", self.network(), self.prefix_len)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub firecracker_bin: PathBuf,
    pub kernel_path: PathBuf,
    /// Read-only template produced by the image builder.
    pub template_image: PathBuf,
    pub boot_args: String,
    pub init_path: String,
    pub sizing: VmSizing,
    /// How long to wait for the hypervisor API socket to appear.
    pub api_socket_timeout_ms: u64,
    /// How often dead hypervisor processes are reaped.
    pub reconcile_interval_secs: u64,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/seatvm/kernel/vmlinux.bin"),
            template_image: PathBuf::from("/var/lib/seatvm/images/template.ext4"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            init_path: crate::rootfs::INIT_PATH.to_string(),
            sizing: VmSizing::default(),
            api_socket_timeout_ms: 5_000,
            reconcile_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Private per-instance image copies.
    pub instance_dir: PathBuf,
    /// Control sockets and hypervisor logs.
    pub run_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("/var/lib/seatvm/instances"),
            run_dir: PathBuf::from("/run/seatvm"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    /// Docker network seats are attached to; the daemon default bridge when unset.
    pub network: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "seatvm/workspace:latest".to_string(),
            network: None,
        }
    }
}

impl HostConfig {
    /// Load from the YAML file named by `SEATVM_CONFIG` (if any), then apply env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        env_override("SEATVM_BRIDGE", &mut config.fabric.bridge_name)?;
        env_override("SEATVM_GATEWAY", &mut config.fabric.gateway)?;
        env_override("SEATVM_PREFIX_LEN", &mut config.fabric.prefix_len)?;
        if let Ok(uplink) = std::env::var("SEATVM_UPLINK") {
            config.fabric.uplink = Some(uplink);
        }

        env_override("SEATVM_FIRECRACKER_BIN", &mut config.vm.firecracker_bin)?;
        env_override("SEATVM_KERNEL", &mut config.vm.kernel_path)?;
        env_override("SEATVM_ROOTFS_TEMPLATE", &mut config.vm.template_image)?;
        env_override("SEATVM_BOOT_ARGS", &mut config.vm.boot_args)?;
        env_override("SEATVM_VCPUS", &mut config.vm.sizing.vcpu_count)?;
        env_override("SEATVM_MEM_MIB", &mut config.vm.sizing.mem_size_mib)?;
        env_override("SEATVM_RECONCILE_SECS", &mut config.vm.reconcile_interval_secs)?;

        env_override("SEATVM_INSTANCE_DIR", &mut config.paths.instance_dir)?;
        env_override("SEATVM_RUN_DIR", &mut config.paths.run_dir)?;

        env_override("SEATVM_CONTAINER_IMAGE", &mut config.container.image)?;
        if let Ok(network) = std::env::var("SEATVM_DOCKER_NETWORK") {
            config.container.network = Some(network);
        }

        config.validate()?;
        info!(bridge = %config.fabric.bridge_name, gateway = %config.fabric.gateway, "Loaded host configuration");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SeatError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| SeatError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        // Guest addresses are gateway-prefix.(10 + seat), which needs a /24.
        if self.fabric.prefix_len != 24 {
            return Err(SeatError::Config(format!(
                "bridge prefix must be /24, got /{}",
                self.fabric.prefix_len
            )));
        }
        // Seats take .11 and up; the gateway must sit below them.
        let host = self.fabric.gateway.octets()[3];
        if host == 0 || u32::from(host) > addressing::SEAT_IP_OFFSET {
            return Err(SeatError::Config(format!(
                "gateway {} must use host address .1-.{} so it never collides with a seat",
                self.fabric.gateway,
                addressing::SEAT_IP_OFFSET
            )));
        }
        if self.fabric.bridge_name.is_empty() || self.fabric.bridge_name.len() > 15 {
            return Err(SeatError::Config(format!(
                "bridge name '{}' must be 1-15 characters",
                self.fabric.bridge_name
            )));
        }
        if self.vm.sizing.vcpu_count == 0 || self.vm.sizing.mem_size_mib == 0 {
            return Err(SeatError::Config("VM sizing must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Image build settings for the template this host boots from.
    ///
    /// Starts from the YAML file named by `SEATVM_BUILD_CONFIG` or from the
    /// container image and template path of this config, then applies the
    /// `SEATVM_BUILD_*` overrides.
    pub fn image_build_from_env(&self) -> Result<ImageBuildConfig> {
        let mut build = match std::env::var_os(BUILD_CONFIG_PATH_ENV) {
            Some(path) => {
                let path = Path::new(&path);
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SeatError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    SeatError::Config(format!("failed to parse {}: {e}", path.display()))
                })?
            }
            None => ImageBuildConfig::new(self.container.image.clone(), self.vm.template_image.clone()),
        };

        env_override("SEATVM_BUILD_IMAGE", &mut build.image)?;
        env_override("SEATVM_BUILD_OUTPUT", &mut build.output)?;
        let mut size_mib = build.size_bytes / (1024 * 1024);
        env_override("SEATVM_BUILD_SIZE_MIB", &mut size_mib)?;
        build.size_bytes = size_mib * 1024 * 1024;
        if let Ok(context) = std::env::var("SEATVM_BUILD_CONTEXT") {
            build.build_context = Some(PathBuf::from(context));
        }
        if let Ok(path) = std::env::var("SEATVM_BUILD_INIT_BINARY") {
            build.init = InitSource::Binary {
                path: PathBuf::from(path),
            };
        }
        if let Ok(raw) = std::env::var("SEATVM_BUILD_NAMESERVERS") {
            build.nameservers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .map_err(|e| SeatError::Config(format!("SEATVM_BUILD_NAMESERVERS={raw}: {e}")))
                })
                .collect::<Result<_>>()?;
        }
        Ok(build)
    }
}

fn env_override<T: FromStr>(name: &str, field: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *field = raw
            .parse()
            .map_err(|e| SeatError::Config(format!("{name}={raw}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_fabric_derivations() {
        let fabric = FabricConfig::default();
        assert_eq!(fabric.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(fabric.network(), Ipv4Addr::new(192, 168, 100, 0));
        assert_eq!(fabric.bridge_cidr(), "192.168.100.1/24");
        assert_eq!(fabric.subnet_cidr(), "192.168.100.0/24");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: HostConfig = serde_yaml::from_str(
            "fabric:\n  bridge_name: br-test\nvm:\n  sizing:\n    vcpu_count: 4\n    mem_size_mib: 2048\n",
        )
        .unwrap();
        assert_eq!(config.fabric.bridge_name, "br-test");
        assert_eq!(config.fabric.gateway, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(config.vm.sizing.vcpu_count, 4);
        assert_eq!(config.vm.init_path, "/sbin/seat-init");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = HostConfig::default();
        config.fabric.prefix_len = 16;
        assert!(matches!(config.validate(), Err(SeatError::Config(_))));
    }

    #[test]
    fn test_validate_keeps_gateway_below_seat_range() {
        let mut config = HostConfig::default();
        for host in [0, 11, 20, 255] {
            config.fabric.gateway = Ipv4Addr::new(192, 168, 100, host);
            assert!(
                matches!(config.validate(), Err(SeatError::Config(_))),
                "gateway .{host} accepted"
            );
        }
        for host in [1, 10] {
            config.fabric.gateway = Ipv4Addr::new(192, 168, 100, host);
            assert!(config.validate().is_ok(), "gateway .{host} rejected");
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("SEATVM_BRIDGE", "envbr0");
        std::env::set_var("SEATVM_VCPUS", "8");
        let config = HostConfig::from_env();
        std::env::remove_var("SEATVM_BRIDGE");
        std::env::remove_var("SEATVM_VCPUS");

        let config = config.unwrap();
        assert_eq!(config.fabric.bridge_name, "envbr0");
        assert_eq!(config.vm.sizing.vcpu_count, 8);
    }

    #[test]
    #[serial]
    fn test_env_override_parse_error() {
        std::env::set_var("SEATVM_GATEWAY", "not-an-ip");
        let result = HostConfig::from_env();
        std::env::remove_var("SEATVM_GATEWAY");
        assert!(matches!(result, Err(SeatError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_config_file_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seatvm.yaml");
        std::fs::write(&path, "container:\n  image: custom/image:1\n").unwrap();
        std::env::set_var(CONFIG_PATH_ENV, &path);
        let config = HostConfig::from_env();
        std::env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(config.unwrap().container.image, "custom/image:1");
    }

    #[test]
    #[serial]
    fn test_image_build_defaults_and_overrides() {
        let host = HostConfig::default();
        let build = host.image_build_from_env().unwrap();
        assert_eq!(build.image, "seatvm/workspace:latest");
        assert_eq!(build.output, host.vm.template_image);
        assert_eq!(build.size_bytes, crate::rootfs::DEFAULT_IMAGE_SIZE);

        std::env::set_var("SEATVM_BUILD_SIZE_MIB", "512");
        std::env::set_var("SEATVM_BUILD_NAMESERVERS", "1.1.1.1, 8.8.8.8");
        let build = host.image_build_from_env();
        std::env::remove_var("SEATVM_BUILD_SIZE_MIB");
        std::env::remove_var("SEATVM_BUILD_NAMESERVERS");

        let build = build.unwrap();
        assert_eq!(build.size_bytes, 512 * 1024 * 1024);
        assert_eq!(
            build.nameservers,
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }
}
