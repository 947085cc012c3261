//! Seats as plain Docker containers, for workshops that do not need a VM.

use crate::addressing;
use crate::config::ContainerConfig;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use seatvm_common::{
    InstanceInfo, Result, Runtime, SeatError, SeatKey, SeatProvider, SetupStage, VmSizing,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const WORKSHOP_LABEL: &str = "seatvm.workshop";
pub const SEAT_LABEL: &str = "seatvm.seat";

pub struct ContainerProvider {
    docker: Arc<Docker>,
    config: ContainerConfig,
}

impl ContainerProvider {
    pub fn new(docker: Arc<Docker>, config: ContainerConfig) -> Self {
        Self { docker, config }
    }

    /// Connect to the local Docker daemon.
    pub fn connect(config: ContainerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SeatError::Tooling(format!("Docker daemon unreachable: {e}")))?;
        Ok(Self::new(Arc::new(docker), config))
    }

    async fn inspect_ip(&self, name: &str) -> std::result::Result<Option<Ipv4Addr>, bollard::errors::Error> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let settings = inspect.network_settings.unwrap_or_default();
        let ip = settings
            .networks
            .as_ref()
            .and_then(|nets| ip_from_networks(nets, self.config.network.as_deref()))
            .or_else(|| settings.ip_address.as_deref().and_then(parse_ip));
        Ok(ip)
    }

    async fn remove(&self, name: &str) -> std::result::Result<(), bollard::errors::Error> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
    }

    #[instrument(skip(self), fields(workshop = %key.workshop, seat = key.seat))]
    async fn start_seat(&self, key: &SeatKey, sizing: VmSizing) -> Result<InstanceInfo> {
        let name = container_name(key);
        let host_config = HostConfig {
            nano_cpus: Some(i64::from(sizing.vcpu_count) * 1_000_000_000),
            memory: Some(i64::from(sizing.mem_size_mib) * 1024 * 1024),
            network_mode: self.config.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.config.image.clone()),
            hostname: Some(name.clone()),
            labels: Some(seat_labels(key)),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| match status_code(&e) {
                Some(409) => SeatError::Conflict(format!("instance {key} already exists")),
                _ => SeatError::setup(SetupStage::Container, e),
            })?;

        let started = async {
            self.docker
                .start_container::<String>(&created.id, None)
                .await
                .map_err(|e| SeatError::setup(SetupStage::Container, e))?;
            self.inspect_ip(&created.id)
                .await
                .map_err(|e| SeatError::setup(SetupStage::Container, e))?
                .ok_or_else(|| {
                    SeatError::setup(SetupStage::Container, "container has no IPv4 address")
                })
        };

        let ip = match started.await {
            Ok(ip) => ip,
            Err(e) => {
                if let Err(rm) = self.remove(&created.id).await {
                    warn!(container = %created.id, error = %rm, "Failed to remove container after failed start");
                }
                return Err(e);
            }
        };

        info!(container = %created.id, %ip, "Container seat running");
        Ok(InstanceInfo {
            key: key.clone(),
            runtime: Runtime::Container,
            ip,
            mac: None,
            interface: None,
            image_path: None,
            pid: None,
            container_id: Some(created.id),
        })
    }
}

#[async_trait]
impl SeatProvider for ContainerProvider {
    fn runtime(&self) -> Runtime {
        Runtime::Container
    }

    async fn create(&self, key: SeatKey, sizing: VmSizing) -> Result<InstanceInfo> {
        self.start_seat(&key, sizing).await
    }

    async fn destroy(&self, key: &SeatKey) -> Result<()> {
        let name = container_name(key);
        match self.remove(&name).await {
            Ok(()) => {
                info!(container = %name, "Container seat removed");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => {
                Err(SeatError::NotFound(format!("instance {key}")))
            }
            Err(e) => Err(SeatError::Internal(format!(
                "failed to remove container {name}: {e}"
            ))),
        }
    }

    async fn list(&self, workshop: &str) -> Result<Vec<InstanceInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{WORKSHOP_LABEL}={workshop}")],
        );
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SeatError::Internal(format!("failed to list containers: {e}")))?;

        let mut infos = Vec::new();
        for summary in summaries {
            let labels = summary.labels.unwrap_or_default();
            let Some(seat) = labels.get(SEAT_LABEL).and_then(|s| s.parse().ok()) else {
                debug!(id = ?summary.id, "Skipping container without seat label");
                continue;
            };
            let ip = summary
                .network_settings
                .and_then(|ns| ns.networks)
                .and_then(|nets| ip_from_networks(&nets, self.config.network.as_deref()))
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            infos.push(InstanceInfo {
                key: SeatKey::new(workshop, seat),
                runtime: Runtime::Container,
                ip,
                mac: None,
                interface: None,
                image_path: None,
                pid: None,
                container_id: summary.id,
            });
        }
        infos.sort_by_key(|i| i.key.seat);
        Ok(infos)
    }

    async fn get_ip(&self, key: &SeatKey) -> Result<Ipv4Addr> {
        match self.inspect_ip(&container_name(key)).await {
            Ok(Some(ip)) => Ok(ip),
            Ok(None) => Err(SeatError::NotFound(format!("address of instance {key}"))),
            Err(e) if status_code(&e) == Some(404) => {
                Err(SeatError::NotFound(format!("instance {key}")))
            }
            Err(e) => Err(SeatError::Internal(format!("failed to inspect {key}: {e}"))),
        }
    }
}

/// `seatvm-<workshop>-<seat>`, using the same sanitizing as on-disk paths.
pub fn container_name(key: &SeatKey) -> String {
    format!("seatvm-{}", addressing::path_stem(key))
}

pub fn seat_labels(key: &SeatKey) -> HashMap<String, String> {
    HashMap::from([
        (WORKSHOP_LABEL.to_string(), key.workshop.clone()),
        (SEAT_LABEL.to_string(), key.seat.to_string()),
    ])
}

/// Address on `preferred` when given and attached, otherwise the first network with one.
pub fn ip_from_networks(
    networks: &HashMap<String, EndpointSettings>,
    preferred: Option<&str>,
) -> Option<Ipv4Addr> {
    let endpoint_ip = |ep: &EndpointSettings| ep.ip_address.as_deref().and_then(parse_ip);

    if let Some(ip) = preferred.and_then(|name| networks.get(name)).and_then(endpoint_ip) {
        return Some(ip);
    }
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();
    names.into_iter().find_map(|name| endpoint_ip(&networks[name]))
}

fn parse_ip(s: &str) -> Option<Ipv4Addr> {
    s.parse().ok()
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}
