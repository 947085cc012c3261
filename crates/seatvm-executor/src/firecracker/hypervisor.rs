//! Launching and supervising one Firecracker process per seat.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use firecracker_rs_sdk::{
    firecracker::FirecrackerOption,
    instance::Instance as FcInstance,
    models::{BootSource, Drive, MachineConfiguration, NetworkInterface as FcNetworkInterface},
};
use seatvm_common::{boot::GUEST_DEVICE, MacAddr, SeatKey};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

const STOP_GRACE: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to boot one guest.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: SeatKey,
    /// Short unique id handed to the hypervisor.
    pub vm_id: String,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub kernel_path: PathBuf,
    pub boot_args: String,
    pub rootfs_path: PathBuf,
    pub tap_name: String,
    pub guest_mac: MacAddr,
    pub api_socket: PathBuf,
    pub log_path: PathBuf,
}

/// Starts guests. The returned process outlives the call that started it.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn GuestProcess>>;
}

/// Handle on a running guest's hypervisor process.
#[async_trait]
pub trait GuestProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_running(&self) -> bool;

    async fn stop(&mut self) -> Result<()>;
}

/// Firecracker driven through its API socket.
#[derive(Debug, Clone)]
pub struct FirecrackerHypervisor {
    firecracker_bin: PathBuf,
    api_socket_timeout: Duration,
}

impl FirecrackerHypervisor {
    pub fn new(firecracker_bin: PathBuf, api_socket_timeout: Duration) -> Self {
        Self {
            firecracker_bin,
            api_socket_timeout,
        }
    }

    async fn wait_for_socket(&self, api_socket: &Path) -> Result<()> {
        let deadline = Instant::now() + self.api_socket_timeout;
        while !api_socket.exists() {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "API socket {} did not appear within {:?}",
                    api_socket.display(),
                    self.api_socket_timeout
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn configure_and_boot(&self, instance: &mut FcInstance, spec: &LaunchSpec) -> Result<()> {
        self.wait_for_socket(&spec.api_socket).await?;

        let machine_config = MachineConfiguration {
            vcpu_count: spec.vcpu_count as isize,
            mem_size_mib: spec.mem_size_mib as isize,
            smt: Some(false),
            cpu_template: None,
            track_dirty_pages: Some(false),
            huge_pages: None,
        };
        instance
            .put_machine_configuration(&machine_config)
            .await
            .map_err(|e| anyhow!("Failed to configure machine: {e:?}"))?;

        let boot_source = BootSource {
            kernel_image_path: spec.kernel_path.clone(),
            boot_args: Some(spec.boot_args.clone()),
            initrd_path: None,
        };
        instance
            .put_guest_boot_source(&boot_source)
            .await
            .map_err(|e| anyhow!("Failed to configure boot source: {e:?}"))?;

        let rootfs_drive = Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: spec.rootfs_path.clone(),
            is_root_device: true,
            is_read_only: false,
            partuuid: None,
            cache_type: None,
            rate_limiter: None,
            io_engine: None,
            socket: None,
        };
        instance
            .put_guest_drive_by_id(&rootfs_drive)
            .await
            .map_err(|e| anyhow!("Failed to configure rootfs drive: {e:?}"))?;

        let net_iface = FcNetworkInterface {
            iface_id: GUEST_DEVICE.to_string(),
            host_dev_name: spec.tap_name.clone().into(),
            guest_mac: Some(spec.guest_mac.to_string()),
            rx_rate_limiter: None,
            tx_rate_limiter: None,
        };
        instance
            .put_guest_network_interface_by_id(&net_iface)
            .await
            .map_err(|e| anyhow!("Failed to configure network interface: {e:?}"))?;

        instance
            .start()
            .await
            .map_err(|e| anyhow!("Failed to start VM: {e:?}"))?;
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    #[instrument(skip(self, spec), fields(seat = %spec.key, vm_id = %spec.vm_id))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn GuestProcess>> {
        if !spec.kernel_path.exists() {
            return Err(anyhow!("Kernel not found: {:?}", spec.kernel_path));
        }

        let mut fc_opt = FirecrackerOption::new(&self.firecracker_bin);
        fc_opt
            .api_sock(&spec.api_socket)
            .id(&spec.vm_id)
            .log_path(Some(spec.log_path.clone()));

        let mut instance = fc_opt
            .build()
            .context("Failed to create Firecracker instance")?;

        instance
            .start_vmm()
            .await
            .map_err(|e| anyhow!("Failed to start VMM process: {e:?}"))?;

        let pid = instance
            .firecracker_pid()
            .or_else(|| find_pid_by_socket(&spec.api_socket));
        info!(?pid, "VMM started, configuring via API");

        if let Err(e) = self.configure_and_boot(&mut instance, spec).await {
            // Half-configured VMM: make sure it does not linger.
            let mut process = FirecrackerProcess::new(instance, spec.api_socket.clone(), pid);
            if let Err(stop_err) = process.stop().await {
                warn!(error = %stop_err, "Failed to stop half-configured VMM");
            }
            return Err(e);
        }

        info!("Guest booted");
        Ok(Box::new(FirecrackerProcess::new(
            instance,
            spec.api_socket.clone(),
            pid,
        )))
    }
}

pub struct FirecrackerProcess {
    instance: Mutex<FcInstance>,
    api_socket: PathBuf,
    pid: Option<u32>,
}

impl FirecrackerProcess {
    fn new(instance: FcInstance, api_socket: PathBuf, pid: Option<u32>) -> Self {
        Self {
            instance: Mutex::new(instance),
            api_socket,
            pid,
        }
    }
}

#[async_trait]
impl GuestProcess for FirecrackerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        match self.pid {
            Some(pid) => pid_alive(pid),
            None => socket_accepts(&self.api_socket),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let graceful = self
            .instance
            .get_mut()
            .stop()
            .await
            .map_err(|e| anyhow!("Failed to stop VM via SDK: {e:?}"));

        let Some(pid) = self.pid else {
            return graceful;
        };

        if wait_for_exit(pid, STOP_GRACE).await {
            return Ok(());
        }

        if let Err(e) = &graceful {
            warn!(pid, error = %e, "Graceful stop failed, killing VMM");
        } else {
            warn!(pid, "VMM ignored shutdown request, killing");
        }
        kill(pid);

        if wait_for_exit(pid, KILL_GRACE).await {
            Ok(())
        } else {
            Err(anyhow!("Firecracker process {pid} did not exit after SIGKILL"))
        }
    }
}

fn kill(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// A process counts as alive while `/proc/<pid>` exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(parse_proc_state(&stat), Some('Z') | Some('X') | None),
        Err(_) => false,
    }
}

/// Firecracker leaves its socket file behind on exit, so only a live listener counts.
pub fn socket_accepts(api_socket: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(api_socket).is_ok()
}

/// State letter from `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so parse from the last `)`.
pub fn parse_proc_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Find the Firecracker process serving `api_socket` by its command line.
pub fn find_pid_by_socket(api_socket: &Path) -> Option<u32> {
    let needle = api_socket.to_string_lossy();
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let matches = cmdline
            .split(|b| *b == 0)
            .any(|arg| String::from_utf8_lossy(arg) == needle);
        if matches && pid_alive(pid) {
            return Some(pid);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_accepts_only_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("fc.sock");
        assert!(!socket_accepts(&socket));

        let listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        assert!(socket_accepts(&socket));

        // The file outlives the listener, like a socket left by an exited VMM.
        drop(listener);
        assert!(socket.exists());
        assert!(!socket_accepts(&socket));
    }

    #[test]
    fn test_parse_proc_state() {
        assert_eq!(parse_proc_state("1234 (firecracker) S 1 1234 1234 0"), Some('S'));
        assert_eq!(parse_proc_state("77 (weird) name) Z 1 2"), Some('Z'));
        assert_eq!(parse_proc_state("garbage"), None);
    }

    #[test]
    fn test_pid_alive_for_self_and_missing() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn test_find_pid_by_socket() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("fake.sock");
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .arg(&marker)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // `sleep 30 <path>` fails on the extra operand on some platforms, so only
        // assert when it is still around.
        sleep(Duration::from_millis(100)).await;
        if let Ok(None) = child.try_wait() {
            assert_eq!(find_pid_by_socket(&marker), child.id());
        }
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_wait_for_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FirecrackerHypervisor::new(
            PathBuf::from("/nonexistent/firecracker"),
            Duration::from_millis(100),
        );
        let err = hv
            .wait_for_socket(&dir.path().join("never.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not appear"));
    }

    #[tokio::test]
    async fn test_launch_fails_without_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FirecrackerHypervisor::new(
            PathBuf::from("/nonexistent/firecracker"),
            Duration::from_millis(100),
        );
        let spec = LaunchSpec {
            key: SeatKey::new("demo", 1),
            vm_id: "st000000000001".to_string(),
            vcpu_count: 1,
            mem_size_mib: 128,
            kernel_path: dir.path().join("missing-vmlinux"),
            boot_args: String::new(),
            rootfs_path: dir.path().join("rootfs.ext4"),
            tap_name: "st000000000001".to_string(),
            guest_mac: MacAddr([0xAA, 0xFC, 0, 0, 0, 1]),
            api_socket: dir.path().join("fc.sock"),
            log_path: dir.path().join("fc.log"),
        };
        let err = hv.launch(&spec).await.err().unwrap();
        assert!(err.to_string().contains("Kernel not found"));
    }
}
