//! MicroVM lifecycle: per-seat tap, private rootfs copy and Firecracker process,
//! tracked in one in-memory registry.

use super::hypervisor::{FirecrackerHypervisor, GuestProcess, Hypervisor, LaunchSpec};
use crate::addressing;
use crate::config::{HostConfig, PathsConfig, VmDefaults};
use crate::network::{IpCommand, NetworkFabric, NetworkOps, TapManager};
use anyhow::Context as _;
use async_trait::async_trait;
use seatvm_common::boot::{kernel_cmdline, BootNetwork};
use seatvm_common::{
    InstanceInfo, MacAddr, Result, Runtime, SeatError, SeatKey, SeatProvider, SetupStage,
    VmSizing,
};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// A running seat and the resources it owns.
pub struct VmInstance {
    pub key: SeatKey,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub tap: String,
    pub image_path: PathBuf,
    pub api_socket: PathBuf,
    pub log_path: PathBuf,
    process: Box<dyn GuestProcess>,
}

impl VmInstance {
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            key: self.key.clone(),
            runtime: Runtime::MicroVm,
            ip: self.ip,
            mac: Some(self.mac),
            interface: Some(self.tap.clone()),
            image_path: Some(self.image_path.clone()),
            pid: self.process.pid(),
            container_id: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    fn resources(&self) -> Provisioned {
        Provisioned {
            tap: self.tap.clone(),
            image_path: self.image_path.clone(),
            api_socket: self.api_socket.clone(),
            log_path: self.log_path.clone(),
        }
    }
}

/// Host resources a seat holds before it is registered.
struct Provisioned {
    tap: String,
    image_path: PathBuf,
    api_socket: PathBuf,
    log_path: PathBuf,
}

struct Inner {
    fabric: NetworkFabric,
    taps: TapManager,
    hypervisor: Arc<dyn Hypervisor>,
    vm: VmDefaults,
    paths: PathsConfig,
    instances: RwLock<HashMap<SeatKey, VmInstance>>,
}

/// Creates and destroys microVM seats.
///
/// Create and Destroy hold the registry's write lock for their whole duration
/// and run on their own task, so a caller that stops waiting does not leave a
/// half-built or half-removed seat behind.
#[derive(Clone)]
pub struct MicroVmManager {
    inner: Arc<Inner>,
}

impl MicroVmManager {
    pub fn new(
        config: &HostConfig,
        ops: Arc<dyn NetworkOps>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        let fabric = NetworkFabric::new(ops.clone(), config.fabric.clone());
        let taps = TapManager::new(ops, config.fabric.bridge_name.clone());
        Self {
            inner: Arc::new(Inner {
                fabric,
                taps,
                hypervisor,
                vm: config.vm.clone(),
                paths: config.paths.clone(),
                instances: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Manager backed by the real `ip`/`iptables` tools and Firecracker.
    pub fn from_config(config: &HostConfig) -> Self {
        let hypervisor = FirecrackerHypervisor::new(
            config.vm.firecracker_bin.clone(),
            Duration::from_millis(config.vm.api_socket_timeout_ms),
        );
        Self::new(config, Arc::new(IpCommand::new()), Arc::new(hypervisor))
    }

    pub async fn create(&self, key: SeatKey, sizing: VmSizing) -> Result<InstanceInfo> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.create(key, sizing).await })
            .await
            .map_err(|e| SeatError::Internal(format!("create task failed: {e}")))?
    }

    pub async fn destroy(&self, key: &SeatKey) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.clone();
        tokio::spawn(async move { inner.destroy(&key).await })
            .await
            .map_err(|e| SeatError::Internal(format!("destroy task failed: {e}")))?
    }

    /// All seats of `workshop`, ordered by seat number.
    pub async fn list(&self, workshop: &str) -> Vec<InstanceInfo> {
        let instances = self.inner.instances.read().await;
        let mut infos: Vec<InstanceInfo> = instances
            .values()
            .filter(|i| i.key.workshop == workshop)
            .map(VmInstance::info)
            .collect();
        infos.sort_by_key(|i| i.key.seat);
        infos
    }

    pub async fn get_ip(&self, key: &SeatKey) -> Result<Ipv4Addr> {
        self.inner
            .instances
            .read()
            .await
            .get(key)
            .map(|i| i.ip)
            .ok_or_else(|| SeatError::NotFound(format!("instance {key}")))
    }

    pub async fn len(&self) -> usize {
        self.inner.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop seats whose hypervisor process has exited and free what they held.
    /// Returns the reaped keys.
    pub async fn reconcile(&self) -> Vec<SeatKey> {
        self.inner.reconcile().await
    }

    /// Run [`MicroVmManager::reconcile`] every `interval` until the handle is stopped.
    pub fn spawn_reconciler(&self, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = inner.reconcile().await;
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Reconciler removed dead instances");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Reconciler stopping");
                            break;
                        }
                    }
                }
            }
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Destroy every registered seat. Used on host shutdown.
    pub async fn shutdown(&self) -> usize {
        let inner = self.inner.clone();
        match tokio::spawn(async move { inner.shutdown().await }).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Shutdown task failed");
                0
            }
        }
    }
}

/// Stops a reconciler started by [`MicroVmManager::spawn_reconciler`].
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

impl Inner {
    #[instrument(skip(self), fields(workshop = %key.workshop, seat = key.seat))]
    async fn create(&self, key: SeatKey, sizing: VmSizing) -> Result<InstanceInfo> {
        let ip = addressing::guest_ip(self.fabric.config().network(), key.seat)?;
        if ip == self.fabric.config().gateway {
            return Err(SeatError::Conflict(format!(
                "address {ip} for {key} is the bridge gateway"
            )));
        }
        let mac = addressing::guest_mac(key.seat);
        if sizing.vcpu_count == 0 || sizing.mem_size_mib == 0 {
            return Err(SeatError::Config(format!(
                "invalid sizing {} vCPU / {} MiB",
                sizing.vcpu_count, sizing.mem_size_mib
            )));
        }

        let mut instances = self.instances.write().await;
        if instances.contains_key(&key) {
            return Err(SeatError::Conflict(format!("instance {key} already exists")));
        }
        // Addresses derive from the seat number alone.
        if let Some(holder) = instances.values().find(|i| i.ip == ip) {
            return Err(SeatError::Conflict(format!(
                "address {ip} for {key} is held by {}",
                holder.key
            )));
        }

        self.fabric
            .ensure_bridge()
            .await
            .map_err(|e| SeatError::setup(SetupStage::Fabric, e))?;

        let tap = addressing::interface_name(&key);
        self.taps
            .create_interface(&tap)
            .await
            .map_err(|e| SeatError::setup(SetupStage::Interface, e))?;

        let provisioned = Provisioned {
            tap,
            image_path: addressing::image_path(&self.paths.instance_dir, &key),
            api_socket: addressing::socket_path(&self.paths.run_dir, &key),
            log_path: addressing::log_path(&self.paths.run_dir, &key),
        };

        let process = match self.boot(&key, ip, mac, sizing, &provisioned).await {
            Ok(process) => process,
            Err(e) => {
                warn!(error = %e, log = %provisioned.log_path.display(), "Create failed, rolling back");
                self.rollback(&provisioned).await;
                return Err(e);
            }
        };

        info!(%ip, %mac, tap = %provisioned.tap, "Instance running");
        let instance = VmInstance {
            key: key.clone(),
            ip,
            mac,
            tap: provisioned.tap,
            image_path: provisioned.image_path,
            api_socket: provisioned.api_socket,
            log_path: provisioned.log_path,
            process,
        };
        let info = instance.info();
        instances.insert(key, instance);
        Ok(info)
    }

    async fn boot(
        &self,
        key: &SeatKey,
        ip: Ipv4Addr,
        mac: MacAddr,
        sizing: VmSizing,
        res: &Provisioned,
    ) -> Result<Box<dyn GuestProcess>> {
        copy_template(&self.vm.template_image, &res.image_path)
            .await
            .map_err(|e| SeatError::setup(SetupStage::ImageCopy, e))?;

        prepare_run_dir(&res.api_socket)
            .await
            .map_err(|e| SeatError::setup(SetupStage::SocketCleanup, e))?;

        let fabric = self.fabric.config();
        let net = BootNetwork::new(ip, fabric.gateway, fabric.netmask());
        let boot_args = kernel_cmdline(&self.vm.boot_args, &self.vm.init_path, &net);
        debug!(%boot_args, "Kernel command line");

        let spec = LaunchSpec {
            key: key.clone(),
            vm_id: res.tap.clone(),
            vcpu_count: sizing.vcpu_count,
            mem_size_mib: sizing.mem_size_mib,
            kernel_path: self.vm.kernel_path.clone(),
            boot_args,
            rootfs_path: res.image_path.clone(),
            tap_name: res.tap.clone(),
            guest_mac: mac,
            api_socket: res.api_socket.clone(),
            log_path: res.log_path.clone(),
        };

        self.hypervisor
            .launch(&spec)
            .await
            .map_err(|e| SeatError::setup(SetupStage::HypervisorStart, e))
    }

    #[instrument(skip(self), fields(workshop = %key.workshop, seat = key.seat))]
    async fn destroy(&self, key: &SeatKey) -> Result<()> {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(key) else {
            return Err(SeatError::NotFound(format!("instance {key}")));
        };

        if instance.process.is_running() {
            if let Err(e) = instance.process.stop().await {
                warn!(error = %e, pid = ?instance.process.pid(), "Failed to stop hypervisor, continuing teardown");
            }
        }

        if let Some(instance) = instances.remove(key) {
            self.release(&instance.resources()).await;
        }
        info!("Instance destroyed");
        Ok(())
    }

    async fn reconcile(&self) -> Vec<SeatKey> {
        let mut instances = self.instances.write().await;
        let dead: Vec<SeatKey> = instances
            .values()
            .filter(|i| !i.process.is_running())
            .map(|i| i.key.clone())
            .collect();

        for key in &dead {
            if let Some(instance) = instances.remove(key) {
                warn!(seat = %key, pid = ?instance.process.pid(), "Hypervisor exited, releasing seat");
                self.release(&instance.resources()).await;
            }
        }
        dead
    }

    async fn shutdown(&self) -> usize {
        let mut instances = self.instances.write().await;
        let count = instances.len();
        for (key, mut instance) in instances.drain() {
            if instance.process.is_running() {
                if let Err(e) = instance.process.stop().await {
                    warn!(seat = %key, error = %e, "Failed to stop hypervisor during shutdown");
                }
            }
            self.release(&instance.resources()).await;
        }
        info!(count, "All instances shut down");
        count
    }

    /// Undo a failed create. The Firecracker log stays behind for diagnosis.
    async fn rollback(&self, res: &Provisioned) {
        self.taps.delete_interface(&res.tap).await;
        for path in [&res.image_path, &res.api_socket] {
            remove_if_exists(path).await;
        }
    }

    /// Best-effort removal of everything a seat holds on the host.
    async fn release(&self, res: &Provisioned) {
        self.rollback(res).await;
        remove_if_exists(&res.log_path).await;
    }
}

async fn copy_template(template: &Path, dest: &Path) -> anyhow::Result<()> {
    if !tokio::fs::try_exists(template).await.unwrap_or(false) {
        anyhow::bail!("template image {} not found", template.display());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(template, dest)
        .await
        .with_context(|| format!("Failed to copy {} to {}", template.display(), dest.display()))?;
    Ok(())
}

async fn prepare_run_dir(api_socket: &Path) -> anyhow::Result<()> {
    if let Some(parent) = api_socket.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    match tokio::fs::remove_file(api_socket).await {
        Ok(()) => {
            debug!(socket = %api_socket.display(), "Removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", api_socket.display())),
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove"),
    }
}

#[async_trait]
impl SeatProvider for MicroVmManager {
    fn runtime(&self) -> Runtime {
        Runtime::MicroVm
    }

    async fn create(&self, key: SeatKey, sizing: VmSizing) -> Result<InstanceInfo> {
        MicroVmManager::create(self, key, sizing).await
    }

    async fn destroy(&self, key: &SeatKey) -> Result<()> {
        MicroVmManager::destroy(self, key).await
    }

    async fn list(&self, workshop: &str) -> Result<Vec<InstanceInfo>> {
        Ok(MicroVmManager::list(self, workshop).await)
    }

    async fn get_ip(&self, key: &SeatKey) -> Result<Ipv4Addr> {
        MicroVmManager::get_ip(self, key).await
    }
}
