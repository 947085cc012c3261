use crate::firecracker::{GuestProcess, Hypervisor, LaunchSpec};
use anyhow::{bail, Result};
use async_trait::async_trait;
use seatvm_common::SeatKey;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct GuestState {
    key: SeatKey,
    pid: u32,
    alive: AtomicBool,
    stop_calls: AtomicUsize,
}

/// Records launches instead of booting anything.
///
/// Like Firecracker it refuses to start without the root drive on disk and
/// leaves its API socket behind as a file.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    launches: Arc<Mutex<Vec<LaunchSpec>>>,
    guests: Arc<Mutex<Vec<Arc<GuestState>>>>,
    fail_launch: Arc<AtomicBool>,
    fail_stop: Arc<AtomicBool>,
    next_pid: Arc<AtomicU32>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Stop requests error out and leave the guest running.
    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Guests that have been launched and not stopped or crashed.
    pub fn running(&self) -> Vec<SeatKey> {
        self.guests
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.alive.load(Ordering::SeqCst))
            .map(|g| g.key.clone())
            .collect()
    }

    /// Simulate the hypervisor process dying on its own.
    pub fn crash(&self, key: &SeatKey) {
        for guest in self.guests.lock().unwrap().iter() {
            if &guest.key == key {
                guest.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn stop_calls(&self, key: &SeatKey) -> usize {
        self.guests
            .lock()
            .unwrap()
            .iter()
            .filter(|g| &g.key == key)
            .map(|g| g.stop_calls.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn GuestProcess>> {
        self.launches.lock().unwrap().push(spec.clone());

        if self.fail_launch.load(Ordering::SeqCst) {
            bail!("injected launch failure for {}", spec.key);
        }
        if !spec.rootfs_path.exists() {
            bail!("Root drive not found: {:?}", spec.rootfs_path);
        }
        if spec.api_socket.exists() {
            bail!("API socket already in use: {:?}", spec.api_socket);
        }
        tokio::fs::write(&spec.api_socket, b"").await?;

        let guest = Arc::new(GuestState {
            key: spec.key.clone(),
            pid: 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
        });
        self.guests.lock().unwrap().push(guest.clone());

        Ok(Box::new(FakeGuest {
            state: guest,
            fail_stop: self.fail_stop.clone(),
        }))
    }
}

pub struct FakeGuest {
    state: Arc<GuestState>,
    fail_stop: Arc<AtomicBool>,
}

#[async_trait]
impl GuestProcess for FakeGuest {
    fn pid(&self) -> Option<u32> {
        Some(self.state.pid)
    }

    fn is_running(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            bail!("injected stop failure for {}", self.state.key);
        }
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}
