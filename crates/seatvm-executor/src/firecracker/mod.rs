//! MicroVM seats on Firecracker.

pub mod hypervisor;
pub mod vm_manager;

pub use hypervisor::{FirecrackerHypervisor, GuestProcess, Hypervisor, LaunchSpec};
pub use vm_manager::{MicroVmManager, ReconcilerHandle, VmInstance};
