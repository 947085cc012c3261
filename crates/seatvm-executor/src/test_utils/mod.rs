//! Host capability probes and in-memory fakes for tests.

use std::process::Command;

#[cfg(any(test, feature = "test-utils"))]
mod hypervisor;
#[cfg(any(test, feature = "test-utils"))]
mod network;

#[cfg(any(test, feature = "test-utils"))]
pub use hypervisor::{FakeGuest, FakeHypervisor};
#[cfg(any(test, feature = "test-utils"))]
pub use network::{FakeLink, FakeNetwork, LinkKind, NetState};

pub fn has_docker() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_firecracker() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }

    Command::new("firecracker")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_kvm() -> bool {
    cfg!(target_os = "linux") && std::path::Path::new("/dev/kvm").exists()
}

pub fn is_root() -> bool {
    // SAFETY: geteuid(2) cannot fail and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test when the Docker daemon is unreachable.
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_firecracker {
    () => {
        if !$crate::test_utils::has_firecracker() || !$crate::test_utils::has_kvm() {
            eprintln!("Test ignored: Firecracker not available (Linux with KVM required)");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_root {
    () => {
        if !$crate::test_utils::is_root() {
            eprintln!("Test ignored: needs root for bridge, tap and mount");
            return;
        }
    };
}
