// Re-export dependencies used in public interfaces of common types

use std::fmt::{self, Display};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod boot;

/// Resource-acquisition stage a setup failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Fabric,
    Interface,
    ImageCopy,
    SocketCleanup,
    HypervisorStart,
    Container,
}

impl Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Fabric => "network fabric setup",
            SetupStage::Interface => "virtual interface setup",
            SetupStage::ImageCopy => "private image copy",
            SetupStage::SocketCleanup => "control socket cleanup",
            SetupStage::HypervisorStart => "hypervisor start",
            SetupStage::Container => "container setup",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SeatError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Invalid Seat: seat {seat} is outside the addressable range 1..={max}")]
    InvalidSeat { seat: u32, max: u32 },

    #[error("Setup Error during {stage}: {message}")]
    Setup { stage: SetupStage, message: String },

    #[error("Missing Tooling: {0}")]
    Tooling(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl SeatError {
    pub fn setup(stage: SetupStage, err: impl Display) -> Self {
        SeatError::Setup {
            stage,
            message: format!("{err:#}"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SeatError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SeatError::Conflict(_))
    }
}

// Define the primary Result type for seat operations
pub type Result<T> = std::result::Result<T, SeatError>;

/// Which provider backs a workshop's seats. Chosen once when the workshop is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[serde(alias = "firecracker")]
    MicroVm,
    #[serde(alias = "docker")]
    Container,
}

impl Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::MicroVm => f.write_str("microvm"),
            Runtime::Container => f.write_str("container"),
        }
    }
}

impl FromStr for Runtime {
    type Err = SeatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "microvm" | "firecracker" => Ok(Runtime::MicroVm),
            "container" | "docker" => Ok(Runtime::Container),
            other => Err(SeatError::Config(format!("unknown runtime '{other}'"))),
        }
    }
}

/// Composite identity of one seat's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeatKey {
    pub workshop: String,
    pub seat: u32,
}

impl SeatKey {
    pub fn new(workshop: impl Into<String>, seat: u32) -> Self {
        Self {
            workshop: workshop.into(),
            seat,
        }
    }
}

impl Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workshop, self.seat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSizing {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

impl Default for VmSizing {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 1024,
        }
    }
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = SeatError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| SeatError::Config(format!("invalid MAC address '{s}'")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| SeatError::Config(format!("invalid MAC address '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(SeatError::Config(format!("invalid MAC address '{s}'")));
        }
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What the control plane sees of a provisioned seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub key: SeatKey,
    pub runtime: Runtime,
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
    /// Host-side tap device, microVM only.
    pub interface: Option<String>,
    /// Private root filesystem copy, microVM only.
    pub image_path: Option<PathBuf>,
    pub pid: Option<u32>,
    /// Container id, container runtime only.
    pub container_id: Option<String>,
}

/// Capability every sandbox backend exposes to the control plane.
#[async_trait]
pub trait SeatProvider: Send + Sync {
    fn runtime(&self) -> Runtime;

    async fn create(&self, key: SeatKey, sizing: VmSizing) -> Result<InstanceInfo>;

    async fn destroy(&self, key: &SeatKey) -> Result<()>;

    async fn list(&self, workshop: &str) -> Result<Vec<InstanceInfo>>;

    async fn get_ip(&self, key: &SeatKey) -> Result<Ipv4Addr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = MacAddr([0xAA, 0xFC, 0x00, 0x00, 0x01, 0x0C]);
        assert_eq!(mac.to_string(), "AA:FC:00:00:01:0C");
        assert_eq!("aa:fc:00:00:01:0c".parse::<MacAddr>().unwrap(), mac);
        assert!("aa:fc:00:00:01".parse::<MacAddr>().is_err());
        assert!("aa:fc:00:00:01:0c:ff".parse::<MacAddr>().is_err());
        assert!("zz:fc:00:00:01:0c".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_runtime_parsing() {
        assert_eq!("firecracker".parse::<Runtime>().unwrap(), Runtime::MicroVm);
        assert_eq!("Docker".parse::<Runtime>().unwrap(), Runtime::Container);
        assert!("podman".parse::<Runtime>().is_err());

        let rt: Runtime = serde_json::from_str("\"docker\"").unwrap();
        assert_eq!(rt, Runtime::Container);
        assert_eq!(serde_json::to_string(&Runtime::MicroVm).unwrap(), "\"microvm\"");
    }

    #[test]
    fn test_instance_info_serialization() {
        let info = InstanceInfo {
            key: SeatKey::new("demo", 3),
            runtime: Runtime::MicroVm,
            ip: Ipv4Addr::new(192, 168, 100, 13),
            mac: Some(MacAddr([0xAA, 0xFC, 0, 0, 0, 3])),
            interface: Some("st0123456789ab".to_string()),
            image_path: None,
            pid: Some(42),
            container_id: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"AA:FC:00:00:00:03\""));
        assert!(json.contains("192.168.100.13"));
        let back: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_setup_error_names_stage() {
        let err = SeatError::setup(SetupStage::HypervisorStart, "socket never appeared");
        assert_eq!(
            err.to_string(),
            "Setup Error during hypervisor start: socket never appeared"
        );
        assert!(SeatError::NotFound("demo/1".into()).is_not_found());
        assert!(SeatError::Conflict("demo/1".into()).is_conflict());
    }
}
