//! Seat lifecycle against in-memory networking and hypervisor fakes.

use seatvm_common::{SeatError, SeatKey, SeatProvider, SetupStage, VmSizing};
use seatvm_executor::addressing;
use seatvm_executor::test_utils::{FakeHypervisor, FakeNetwork};
use seatvm_executor::{HostConfig, MicroVmManager};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tempfile::TempDir;

struct Host {
    dir: TempDir,
    config: HostConfig,
    net: Arc<FakeNetwork>,
    hv: FakeHypervisor,
    manager: MicroVmManager,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("images/template.ext4");
        std::fs::create_dir_all(template.parent().unwrap()).unwrap();
        std::fs::write(&template, vec![0u8; 4096]).unwrap();

        let mut config = HostConfig::default();
        config.vm.template_image = template;
        config.paths.instance_dir = dir.path().join("instances");
        config.paths.run_dir = dir.path().join("run");

        let net = Arc::new(FakeNetwork::new());
        let hv = FakeHypervisor::new();
        let manager = MicroVmManager::new(&config, net.clone(), Arc::new(hv.clone()));
        Self {
            dir,
            config,
            net,
            hv,
            manager,
        }
    }

    fn image(&self, key: &SeatKey) -> std::path::PathBuf {
        addressing::image_path(&self.config.paths.instance_dir, key)
    }

    fn socket(&self, key: &SeatKey) -> std::path::PathBuf {
        addressing::socket_path(&self.config.paths.run_dir, key)
    }

    fn instance_files(&self) -> usize {
        std::fs::read_dir(&self.config.paths.instance_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn sizing() -> VmSizing {
    VmSizing {
        vcpu_count: 1,
        mem_size_mib: 256,
    }
}

#[tokio::test]
async fn test_end_to_end_demo_seat() {
    let host = Host::new();
    let key = SeatKey::new("demo", 1);

    let info = host.manager.create(key.clone(), sizing()).await.unwrap();
    assert_eq!(info.ip, Ipv4Addr::new(192, 168, 100, 11));
    assert_eq!(host.manager.get_ip(&key).await.unwrap(), info.ip);
    assert_eq!(host.manager.list("demo").await.len(), 1);
    assert!(host.image(&key).exists());

    host.manager.destroy(&key).await.unwrap();
    assert!(host.manager.list("demo").await.is_empty());
    assert!(!host.image(&key).exists());
    assert!(!host.socket(&key).exists());
    assert!(host.net.snapshot().taps().is_empty());

    let again = host.manager.create(key.clone(), sizing()).await.unwrap();
    assert_eq!(again.ip, info.ip);
    assert_eq!(host.hv.launches().len(), 2);
}

#[tokio::test]
async fn test_no_double_registration() {
    let host = Host::new();
    let key = SeatKey::new("demo", 2);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = host.manager.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { manager.create(key, sizing()).await }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(host.hv.launches().len(), 1);
    assert_eq!(host.net.snapshot().taps().len(), 1);
    assert_eq!(host.manager.list("demo").await.len(), 1);
}

#[tokio::test]
async fn test_rollback_on_hypervisor_failure() {
    let host = Host::new();
    let key = SeatKey::new("demo", 3);
    host.hv.fail_launch(true);

    let err = host.manager.create(key.clone(), sizing()).await.unwrap_err();
    assert!(
        matches!(
            err,
            SeatError::Setup {
                stage: SetupStage::HypervisorStart,
                ..
            }
        ),
        "{err}"
    );

    assert!(host.manager.get_ip(&key).await.unwrap_err().is_not_found());
    assert!(!host.image(&key).exists());
    assert_eq!(host.instance_files(), 0);
    assert!(host.net.snapshot().taps().is_empty());

    // The host is left clean enough for the same seat to come up.
    host.hv.fail_launch(false);
    host.manager.create(key, sizing()).await.unwrap();
}

#[tokio::test]
async fn test_fabric_setup_is_idempotent_across_creates() {
    let host = Host::new();
    for seat in 1..=5 {
        host.manager
            .create(SeatKey::new("demo", seat), sizing())
            .await
            .unwrap();
    }

    let state = host.net.snapshot();
    assert_eq!(state.bridges(), vec!["seatbr0".to_string()]);
    assert_eq!(
        state.links["seatbr0"].addrs,
        vec![Ipv4Addr::new(192, 168, 100, 1)]
    );
    assert_eq!(state.rules.len(), 3);
    assert_eq!(state.taps().len(), 5);
    for tap in state.taps() {
        assert_eq!(state.links[&tap].master.as_deref(), Some("seatbr0"));
        assert!(tap.len() <= addressing::MAX_IFNAME_LEN);
    }
}

#[tokio::test]
async fn test_destroy_is_retry_safe_when_stop_fails() {
    let host = Host::new();
    let key = SeatKey::new("demo", 4);
    host.manager.create(key.clone(), sizing()).await.unwrap();

    host.hv.fail_stop(true);
    host.manager.destroy(&key).await.unwrap();
    assert_eq!(host.hv.stop_calls(&key), 1);
    assert!(host.manager.list("demo").await.is_empty());
    assert!(!host.image(&key).exists());
    assert!(!host.socket(&key).exists());
    assert!(host.net.snapshot().taps().is_empty());

    assert!(host.manager.destroy(&key).await.unwrap_err().is_not_found());
    assert!(host.manager.destroy(&key).await.unwrap_err().is_not_found());

    host.hv.fail_stop(false);
    host.manager.create(key, sizing()).await.unwrap();
}

#[tokio::test]
async fn test_destroy_tolerates_missing_resources() {
    let host = Host::new();
    let key = SeatKey::new("demo", 6);
    let info = host.manager.create(key.clone(), sizing()).await.unwrap();

    // Someone cleaned up behind our back.
    std::fs::remove_file(host.image(&key)).unwrap();
    host.net.add_existing_tap("unrelated0");
    let tap = info.interface.unwrap();
    let _ = std::fs::remove_file(host.socket(&key));
    assert!(host.net.snapshot().links.contains_key(&tap));

    host.manager.destroy(&key).await.unwrap();
    assert_eq!(host.net.snapshot().taps(), vec!["unrelated0".to_string()]);
}

#[tokio::test]
async fn test_fabric_failure_aborts_create() {
    let host = Host::new();
    host.net.fail("create_bridge");

    let err = host
        .manager
        .create(SeatKey::new("demo", 1), sizing())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SeatError::Setup {
            stage: SetupStage::Fabric,
            ..
        }
    ));
    assert!(host.hv.launches().is_empty());
    assert_eq!(host.instance_files(), 0);
}

#[tokio::test]
async fn test_list_is_scoped_to_workshop() {
    let host = Host::new();
    host.manager
        .create(SeatKey::new("alpha", 2), sizing())
        .await
        .unwrap();
    host.manager
        .create(SeatKey::new("alpha", 1), sizing())
        .await
        .unwrap();
    host.manager
        .create(SeatKey::new("beta", 3), sizing())
        .await
        .unwrap();

    let alpha: Vec<u32> = host
        .manager
        .list("alpha")
        .await
        .iter()
        .map(|i| i.key.seat)
        .collect();
    assert_eq!(alpha, vec![1, 2]);
    assert_eq!(host.manager.list("beta").await.len(), 1);
    assert!(host.manager.list("gamma").await.is_empty());
}

#[tokio::test]
async fn test_works_through_provider_trait() {
    let host = Host::new();
    let provider: Arc<dyn SeatProvider> = Arc::new(host.manager.clone());
    let key = SeatKey::new("demo", 7);

    let info = provider.create(key.clone(), sizing()).await.unwrap();
    assert_eq!(provider.get_ip(&key).await.unwrap(), info.ip);
    assert_eq!(provider.list("demo").await.unwrap().len(), 1);
    provider.destroy(&key).await.unwrap();
    assert!(provider.get_ip(&key).await.unwrap_err().is_not_found());
    drop(host.dir);
}
