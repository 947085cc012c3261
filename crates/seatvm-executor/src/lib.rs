//! Host side of seat provisioning: network fabric, microVM lifecycle, container
//! seats and the root filesystem image builder.

// Re-export dependencies needed by consumers of the public API
pub use bollard;
pub use seatvm_common as common;

pub mod addressing;
pub mod command;
pub mod config;
pub mod container;
pub mod firecracker;
pub mod network;
pub mod provider;
pub mod rootfs;
pub mod test_utils;

pub use config::HostConfig;
pub use container::ContainerProvider;
pub use firecracker::{MicroVmManager, ReconcilerHandle};
pub use network::{IpCommand, NetworkFabric, NetworkOps, TapManager};
pub use provider::ProviderSet;
pub use rootfs::{ImageBuildConfig, ImageBuildError, ImageBuilder};
