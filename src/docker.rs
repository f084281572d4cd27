//! Docker-backed provisioning for local and single-node deployments
//!
//! A unit is a labelled container on the configured network and the Docker
//! daemon itself is the only compute host. Each container is reachable on
//! that network as `<role>.<workload>`, which is how a backend's monitor
//! finds its frontend.

use crate::config::{ProvisioningConfig, PullPolicy, TemplateConfig, TemplatesConfig};
use crate::error::{ProvisionError, CAPACITY_REASON_PREFIX};
use crate::events::UnitEvent;
use crate::name::Role;
use crate::provider::{
    DesiredStatus, FleetApi, FleetDescription, FleetInstance, HealthStatus, HostDetail, HostRef, Provisioner,
    UnitDetail, UnitOverrides, UnitRef, UnitStatus, ROLE_KEY, WORKLOAD_KEY,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, HealthStatusEnum, HostConfig,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Label carrying the pool a container belongs to
pub const POOL_LABEL: &str = "wakegate.pool";
/// Label carrying the template a container was created from
pub const TEMPLATE_LABEL: &str = "wakegate.template";

/// Id of the single compute host
pub const LOCAL_HOST_ID: &str = "local";

/// Delay before re-subscribing to the daemon's event stream
const EVENT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Provisioner over one Docker daemon
pub struct DockerProvisioner {
    client: Docker,
    network: String,
    pull_policy: PullPolicy,
    templates: HashMap<String, TemplateConfig>,
}

impl DockerProvisioner {
    /// Connect to the daemon at `config.docker_host`, or the local default socket
    pub async fn connect(config: &ProvisioningConfig, templates: &TemplatesConfig) -> anyhow::Result<Self> {
        let client = match config.docker_host.as_deref() {
            Some(host) => connect_to_host(host)?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to the local Docker daemon: {}", e))?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;
        debug!("Connected to Docker daemon");

        let templates = [&templates.frontend, &templates.backend]
            .into_iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();

        Ok(Self {
            client,
            network: config.network.clone(),
            pull_policy: config.pull_policy,
            templates,
        })
    }

    async fn pull_image_if_needed(&self, image: &str) -> Result<(), ProvisionError> {
        let should_pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(ProvisionError::Rejected(format!(
                        "image '{}' not found locally and pull_policy is 'never'",
                        image
                    )));
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(ProvisionError::Rejected(format!("pull of '{}' failed: {}", image, error)));
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => return Err(classify(&e)),
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInspectResponse>, ProvisionError> {
        match self.client.inspect_container(id, None).await {
            Ok(info) => Ok(Some(info)),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(classify(&e)),
        }
    }

    /// Convert container events into unit events until shutdown
    pub async fn watch_events(
        &self,
        pool: &str,
        events_tx: mpsc::Sender<UnitEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("event".to_string(), vec!["start".to_string(), "die".to_string()]);
        filters.insert("label".to_string(), vec![format!("{}={}", POOL_LABEL, pool)]);

        info!(pool, "Watching Docker container events");

        loop {
            let options = EventsOptions::<String> {
                filters: filters.clone(),
                ..Default::default()
            };
            let mut stream = Box::pin(self.client.events(Some(options)));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Docker event watcher shutting down");
                            return;
                        }
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(message)) => {
                                let Some(actor) = message.actor else { continue };
                                let Some(id) = actor.id else { continue };
                                let attributes = actor.attributes.unwrap_or_default();
                                let event = match message.action.as_deref() {
                                    Some("start") => self.started_event(pool, &id, &attributes).await,
                                    Some("die") => Some(stopped_event(&id, &attributes)),
                                    _ => None,
                                };
                                if let Some(event) = event {
                                    if events_tx.send(event).await.is_err() {
                                        debug!("Event consumer gone, stopping watcher");
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Docker event stream failed");
                                break;
                            }
                            None => {
                                warn!("Docker event stream ended");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(EVENT_RETRY_DELAY) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn started_event(&self, pool: &str, id: &str, attributes: &HashMap<String, String>) -> Option<UnitEvent> {
        match self.describe_units(pool, &[id.to_string()]).await {
            Ok(units) => units.first().map(UnitEvent::from_unit),
            Err(e) => {
                error!(container_id = id, error = %e, "Failed to inspect started container");
                let mut event = stopped_event(id, attributes);
                event.status = UnitStatus::Running;
                Some(event)
            }
        }
    }
}

fn stopped_event(id: &str, attributes: &HashMap<String, String>) -> UnitEvent {
    UnitEvent {
        unit: id.to_string(),
        status: UnitStatus::Stopped,
        role: attributes.get(ROLE_KEY).and_then(|r| r.parse().ok()),
        workload: attributes.get(WORKLOAD_KEY).cloned(),
        address: None,
        public_address: None,
    }
}

/// Attach the container to `network` under its `<role>.<workload>` alias
fn networking_config(network: &str, overrides: &UnitOverrides) -> NetworkingConfig<String> {
    let alias = overrides
        .metadata
        .get(ROLE_KEY)
        .and_then(|role| role.parse::<Role>().ok())
        .zip(overrides.metadata.get(WORKLOAD_KEY))
        .map(|(role, workload)| role.endpoint_host(workload));

    let mut endpoints_config = HashMap::new();
    endpoints_config.insert(
        network.to_string(),
        EndpointSettings {
            aliases: alias.map(|alias| vec![alias]),
            ..Default::default()
        },
    );
    NetworkingConfig { endpoints_config }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

/// Map a daemon error onto the provisioning error classes. Resource
/// exhaustion is reported with the capacity prefix.
fn classify(err: &bollard::errors::Error) -> ProvisionError {
    let message = err.to_string();
    if is_resource_exhaustion(&message) {
        return ProvisionError::from_reason(format!("{}{}", CAPACITY_REASON_PREFIX, message));
    }
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code < 500 => {
            ProvisionError::Rejected(message)
        }
        _ => ProvisionError::Transport(message),
    }
}

fn is_resource_exhaustion(message: &str) -> bool {
    let message = message.to_lowercase();
    ["cannot allocate memory", "out of memory", "no space left", "insufficient", "resource temporarily unavailable"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn unit_status(info: &ContainerInspectResponse) -> UnitStatus {
    match info.state.as_ref().and_then(|s| s.status) {
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => UnitStatus::Pending,
        Some(ContainerStateStatusEnum::RUNNING) => UnitStatus::Running,
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::REMOVING) => UnitStatus::Stopped,
        _ => UnitStatus::Unknown,
    }
}

/// Containers without a healthcheck count as healthy while running
fn health_status(info: &ContainerInspectResponse, status: UnitStatus) -> HealthStatus {
    let health = info
        .state
        .as_ref()
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status);
    match health {
        Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthStatus::Unknown,
        _ if status == UnitStatus::Running => HealthStatus::Healthy,
        _ => HealthStatus::Unknown,
    }
}

fn to_unit_detail(info: &ContainerInspectResponse, network: &str) -> Option<UnitDetail> {
    let id = info.id.clone()?;
    let status = unit_status(info);
    let address = info
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.as_ref())
        .and_then(|networks| networks.get(network))
        .and_then(|endpoint| endpoint.ip_address.clone())
        .filter(|ip| !ip.is_empty());
    let metadata: BTreeMap<String, String> = info
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .map(|labels| {
            labels
                .iter()
                .filter(|(k, _)| k.starts_with("wakegate."))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    Some(UnitDetail {
        id,
        status,
        health: health_status(info, status),
        address,
        public_address: None,
        host: Some(LOCAL_HOST_ID.to_string()),
        metadata,
    })
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn list_units(&self, pool: &str, desired: DesiredStatus) -> Result<Vec<UnitRef>, ProvisionError> {
        let states = match desired {
            DesiredStatus::Running => vec!["created", "restarting", "running"],
            DesiredStatus::Stopped => vec!["exited", "dead", "removing"],
        };
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", POOL_LABEL, pool)]);
        filters.insert("status".to_string(), states.into_iter().map(str::to_string).collect());

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await.map_err(|e| classify(&e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn describe_units(&self, _pool: &str, units: &[UnitRef]) -> Result<Vec<UnitDetail>, ProvisionError> {
        let mut details = Vec::with_capacity(units.len());
        for id in units {
            if let Some(info) = self.inspect(id).await? {
                details.extend(to_unit_detail(&info, &self.network));
            }
        }
        Ok(details)
    }

    async fn create_unit(
        &self,
        pool: &str,
        template: &str,
        overrides: &UnitOverrides,
    ) -> Result<UnitRef, ProvisionError> {
        let template_config = self
            .templates
            .get(template)
            .ok_or_else(|| ProvisionError::Rejected(format!("unknown template '{}'", template)))?;
        let image = template_config
            .image
            .as_deref()
            .ok_or_else(|| ProvisionError::Rejected(format!("template '{}' has no image", template)))?;

        self.pull_image_if_needed(image).await?;

        let mut labels: HashMap<String, String> = overrides
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(POOL_LABEL.to_string(), pool.to_string());
        labels.insert(TEMPLATE_LABEL.to_string(), template.to_string());

        let mut env: Vec<String> = template_config
            .env
            .iter()
            .chain(overrides.env.iter())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", template_config.port));

        let mut host_config = HostConfig {
            network_mode: Some(self.network.clone()),
            ..Default::default()
        };
        if let Some(ref memory) = template_config.memory {
            host_config.memory =
                Some(parse_memory_limit(memory).map_err(|e| ProvisionError::Rejected(e.to_string()))?);
        }
        if let Some(ref cpus) = template_config.cpus {
            let cpu_count: f64 = cpus
                .parse()
                .map_err(|_| ProvisionError::Rejected(format!("invalid CPU limit: {}", cpus)))?;
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let workload = overrides.metadata.get(WORKLOAD_KEY).map(String::as_str).unwrap_or("unit");
        let suffix = Uuid::new_v4().simple().to_string();
        let container_name = format!(
            "{}-{}-{}",
            overrides.container.as_deref().unwrap_or(template),
            workload,
            &suffix[..8]
        );

        let container_config = Config {
            image: Some(image.to_string()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config: Some(networking_config(&self.network, overrides)),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };
        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| classify(&e))?;
        let container_id = response.id;
        info!(container_id, container_name, image, "Created Docker container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(&e))?;
        info!(container_id, "Started Docker container");

        Ok(container_id)
    }

    async fn list_hosts(&self, _pool: &str) -> Result<Vec<HostRef>, ProvisionError> {
        Ok(vec![LOCAL_HOST_ID.to_string()])
    }

    async fn describe_hosts(&self, _pool: &str, hosts: &[HostRef]) -> Result<Vec<HostDetail>, ProvisionError> {
        let connected = self.client.ping().await.is_ok();
        Ok(hosts
            .iter()
            .filter(|h| h.as_str() == LOCAL_HOST_ID)
            .map(|h| HostDetail {
                id: h.clone(),
                active: true,
                connected,
                instance_id: Some(LOCAL_HOST_ID.to_string()),
            })
            .collect())
    }
}

#[derive(Debug)]
struct LocalFleetState {
    desired: u32,
    protected: bool,
}

/// Fleet sizing for a single daemon: at most one host, always present.
/// Desired capacity and protection are recorded so the controller converges.
#[derive(Debug)]
pub struct LocalFleet {
    state: Mutex<LocalFleetState>,
}

impl LocalFleet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalFleetState {
                desired: 1,
                protected: false,
            }),
        }
    }
}

impl Default for LocalFleet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetApi for LocalFleet {
    async fn describe_fleet(&self, _fleet_id: &str) -> Result<FleetDescription, ProvisionError> {
        let state = self.state.lock();
        Ok(FleetDescription {
            desired: state.desired,
            max: 1,
            instances: vec![FleetInstance {
                id: LOCAL_HOST_ID.to_string(),
                lifecycle_state: "InService".to_string(),
                protected: state.protected,
            }],
        })
    }

    async fn set_desired_capacity(&self, fleet_id: &str, desired: u32) -> Result<(), ProvisionError> {
        let desired = desired.min(1);
        self.state.lock().desired = desired;
        if desired == 0 {
            info!(fleet_id, "Fleet scaled to zero; the local daemon stays up but takes no new units");
        }
        Ok(())
    }

    async fn set_instance_protection(
        &self,
        _fleet_id: &str,
        instance_ids: &[String],
        protected: bool,
    ) -> Result<(), ProvisionError> {
        if instance_ids.iter().any(|id| id == LOCAL_HOST_ID) {
            self.state.lock().protected = protected;
        }
        Ok(())
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches("kb").trim_end_matches('k'), 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::peer_address_from_env;
    use crate::name::WorkloadName;
    use bollard::models::{ContainerConfig, ContainerState, Health, NetworkSettings};

    fn container(status: ContainerStateStatusEnum, health: Option<HealthStatusEnum>) -> ContainerInspectResponse {
        let mut labels = HashMap::new();
        labels.insert(WORKLOAD_KEY.to_string(), "demo".to_string());
        labels.insert(ROLE_KEY.to_string(), "backend".to_string());
        labels.insert("com.example.other".to_string(), "x".to_string());

        let mut networks = HashMap::new();
        networks.insert(
            "wakegate".to_string(),
            EndpointSettings {
                ip_address: Some("172.18.0.5".to_string()),
                ..Default::default()
            },
        );

        ContainerInspectResponse {
            id: Some("abc123".to_string()),
            state: Some(ContainerState {
                status: Some(status),
                health: health.map(|status| Health {
                    status: Some(status),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                labels: Some(labels),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }

    #[test]
    fn test_running_container_maps_to_unit() {
        let unit = to_unit_detail(&container(ContainerStateStatusEnum::RUNNING, None), "wakegate").unwrap();
        assert_eq!(unit.id, "abc123");
        assert_eq!(unit.status, UnitStatus::Running);
        assert_eq!(unit.health, HealthStatus::Healthy);
        assert_eq!(unit.address.as_deref(), Some("172.18.0.5"));
        assert_eq!(unit.workload(), Some("demo"));
        assert!(!unit.metadata.contains_key("com.example.other"));
        assert_eq!(unit.host.as_deref(), Some(LOCAL_HOST_ID));
    }

    #[test]
    fn test_container_health_and_state() {
        let starting = container(ContainerStateStatusEnum::RUNNING, Some(HealthStatusEnum::STARTING));
        assert_eq!(to_unit_detail(&starting, "wakegate").unwrap().health, HealthStatus::Unknown);

        let unhealthy = container(ContainerStateStatusEnum::RUNNING, Some(HealthStatusEnum::UNHEALTHY));
        assert_eq!(to_unit_detail(&unhealthy, "wakegate").unwrap().health, HealthStatus::Unhealthy);

        let created = container(ContainerStateStatusEnum::CREATED, None);
        assert_eq!(to_unit_detail(&created, "wakegate").unwrap().status, UnitStatus::Pending);

        let exited = container(ContainerStateStatusEnum::EXITED, None);
        assert_eq!(to_unit_detail(&exited, "wakegate").unwrap().status, UnitStatus::Stopped);
    }

    #[test]
    fn test_address_comes_from_configured_network() {
        let unit = to_unit_detail(&container(ContainerStateStatusEnum::RUNNING, None), "bridge").unwrap();
        assert!(unit.address.is_none());
    }

    #[test]
    fn test_resource_exhaustion_is_capacity() {
        assert!(is_resource_exhaustion("OCI runtime create failed: cannot allocate memory"));
        assert!(is_resource_exhaustion("Insufficient resources"));
        assert!(!is_resource_exhaustion("No such image: game:latest"));
    }

    #[test]
    fn test_die_event_carries_labels() {
        let mut attributes = HashMap::new();
        attributes.insert(WORKLOAD_KEY.to_string(), "demo".to_string());
        attributes.insert(ROLE_KEY.to_string(), "frontend".to_string());
        let event = stopped_event("abc", &attributes);
        assert_eq!(event.status, UnitStatus::Stopped);
        assert_eq!(event.workload.as_deref(), Some("demo"));
        assert_eq!(event.role, Some(Role::Frontend));
    }

    #[test]
    fn test_backend_monitor_peer_is_frontend_alias() {
        let demo = WorkloadName::parse("demo").unwrap();
        let frontend = UnitOverrides::for_endpoint(&demo, Role::Frontend, None);
        let backend = UnitOverrides::for_endpoint(&demo, Role::Backend, None);

        let config = networking_config("wakegate", &frontend);
        let aliases = config.endpoints_config["wakegate"].aliases.clone().unwrap();

        // The backend's monitor resolves its peer through the frontend's alias
        let peer = peer_address_from_env(Role::Backend, |k| backend.env.get(k).cloned()).unwrap();
        assert_eq!(aliases, vec![peer]);

        let config = networking_config("wakegate", &backend);
        assert_eq!(config.endpoints_config["wakegate"].aliases, Some(vec!["backend.demo".to_string()]));
    }

    #[tokio::test]
    async fn test_local_fleet_is_capped_at_one_host() {
        let fleet = LocalFleet::new();
        fleet.set_desired_capacity("local", 3).await.unwrap();
        assert_eq!(fleet.describe_fleet("local").await.unwrap().desired, 1);

        fleet
            .set_instance_protection("local", &[LOCAL_HOST_ID.to_string()], true)
            .await
            .unwrap();
        assert!(fleet.describe_fleet("local").await.unwrap().instances[0].protected);

        fleet.set_desired_capacity("local", 0).await.unwrap();
        assert_eq!(fleet.describe_fleet("local").await.unwrap().desired, 0);
    }
}
