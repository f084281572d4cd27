use crate::name::Role;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the launch service and the health monitor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Lease and name record store
    #[serde(default)]
    pub store: StoreConfig,

    /// Provisioning system the units and hosts live in
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Unit templates per role
    #[serde(default)]
    pub templates: TemplatesConfig,

    /// Launch orchestrator knobs
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Compute fleet controller knobs
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Health monitor knobs
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Name registration
    #[serde(default)]
    pub registration: RegistrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file shared by every launch service process on the host
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Image pull policy for Docker units
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningConfig {
    /// Pool (cluster) the units and hosts belong to
    #[serde(default = "default_pool")]
    pub pool: String,

    /// Docker host URL (default: local socket)
    pub docker_host: Option<String>,

    /// Docker network the units are attached to; unit addresses are taken from it
    #[serde(default = "default_network")]
    pub network: String,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            docker_host: None,
            network: default_network(),
            pull_policy: PullPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    #[serde(default = "TemplateConfig::default_frontend")]
    pub frontend: TemplateConfig,

    #[serde(default = "TemplateConfig::default_backend")]
    pub backend: TemplateConfig,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            frontend: TemplateConfig::default_frontend(),
            backend: TemplateConfig::default_backend(),
        }
    }
}

impl TemplatesConfig {
    pub fn for_role(&self, role: Role) -> &TemplateConfig {
        match role {
            Role::Frontend => &self.frontend,
            Role::Backend => &self.backend,
        }
    }
}

/// How a unit of one role is created
#[derive(Debug, Deserialize, Clone)]
pub struct TemplateConfig {
    /// Template id passed to the provisioning API
    pub id: String,

    /// Container image run for this template
    pub image: Option<String>,

    /// Container the per-request overrides apply to
    pub container: Option<String>,

    /// Port the unit serves on
    #[serde(default = "default_unit_port")]
    pub port: u16,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Environment variables set on every unit of this template
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl TemplateConfig {
    fn default_frontend() -> Self {
        Self::named("wakegate-frontend")
    }

    fn default_backend() -> Self {
        Self::named("wakegate-backend")
    }

    fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            image: None,
            container: None,
            port: default_unit_port(),
            memory: None,
            cpus: None,
            env: HashMap::new(),
        }
    }

    /// Every problem with this template, empty when it is valid
    pub fn validate(&self, role: Role) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push(format!("{}: template 'id' must not be empty", role));
        }
        if self.port == 0 {
            errors.push(format!("{}: 'port' must be non-zero", role));
        }
        errors
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaunchConfig {
    /// Launch lease lifetime in seconds (default: 900)
    #[serde(default = "default_launch_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// How long to wait for a compute host to join the pool (default: 180)
    #[serde(default = "default_capacity_wait")]
    pub capacity_wait_secs: u64,

    /// Create retries after a capacity failure (default: 3)
    #[serde(default = "default_capacity_retries")]
    pub capacity_retries: u32,

    /// Wait after requesting an extra host before retrying (default: 10)
    #[serde(default = "default_capacity_backoff")]
    pub capacity_backoff_secs: u64,

    /// How long a new unit may take to reach Running (default: 300)
    #[serde(default = "default_running_timeout")]
    pub running_timeout_secs: u64,

    /// Interval between unit status polls (default: 3)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long to wait for the frontend to answer on its public name (default: 90)
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,

    /// Hard ceiling for a whole launch request (default: 900)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl LaunchConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn capacity_wait(&self) -> Duration {
        Duration::from_secs(self.capacity_wait_secs)
    }

    pub fn capacity_backoff(&self) -> Duration {
        Duration::from_secs(self.capacity_backoff_secs)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_launch_lease_ttl(),
            capacity_wait_secs: default_capacity_wait(),
            capacity_retries: default_capacity_retries(),
            capacity_backoff_secs: default_capacity_backoff(),
            running_timeout_secs: default_running_timeout(),
            poll_interval_secs: default_poll_interval(),
            reachability_timeout_secs: default_reachability_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    /// Fleet (autoscaling group) id passed to the fleet sizing API
    #[serde(default = "default_fleet_id")]
    pub fleet_id: String,

    /// Backend units one compute host can take (default: 3)
    #[serde(default = "default_max_units_per_host")]
    pub max_units_per_host: u32,

    /// Fleet evaluation lease lifetime in seconds (default: 300)
    #[serde(default = "default_fleet_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Scheduled evaluation interval in seconds (default: 21600)
    #[serde(default = "default_fleet_schedule")]
    pub schedule_secs: u64,
}

impl FleetConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn schedule(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_id: default_fleet_id(),
            max_units_per_host: default_max_units_per_host(),
            lease_ttl_secs: default_fleet_lease_ttl(),
            schedule_secs: default_fleet_schedule(),
        }
    }
}

/// Inter-cycle delay policy of the health monitor
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Always wait the base interval
    #[default]
    Fixed,
    /// Wait `interval * 2^(failures-1)`, capped
    Exponential,
}

/// What the monitor signals when the failure threshold is reached
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateTarget {
    /// The monitor's own process group
    #[default]
    ProcessGroup,
    /// The supervising parent process
    Parent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Grace period of the frontend's monitor, which waits on backend capacity (default: 600)
    #[serde(default = "default_frontend_grace")]
    pub frontend_grace_secs: u64,

    /// Grace period of the backend's monitor (default: 60)
    #[serde(default = "default_backend_grace")]
    pub backend_grace_secs: u64,

    /// Base delay between probe cycles in seconds (default: 5)
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// Probe attempts per cycle (default: 5)
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    /// Delay between attempts in a cycle in milliseconds (default: 1000)
    #[serde(default = "default_attempt_spacing")]
    pub attempt_spacing_ms: u64,

    /// Per-attempt timeout in milliseconds (default: 2500)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Consecutive failed cycles before self-termination (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Cap of the exponential backoff in seconds (default: 30)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default)]
    pub terminate: TerminateTarget,

    /// Health path probed on the peer (default: /health)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Peer port when the peer URL is derived from an address (default: 8080)
    #[serde(default = "default_unit_port")]
    pub peer_port: u16,
}

impl MonitorConfig {
    pub fn grace(&self, role: Role) -> Duration {
        Duration::from_secs(match role {
            Role::Frontend => self.frontend_grace_secs,
            Role::Backend => self.backend_grace_secs,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn attempt_spacing(&self) -> Duration {
        Duration::from_millis(self.attempt_spacing_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            frontend_grace_secs: default_frontend_grace(),
            backend_grace_secs: default_backend_grace(),
            interval_secs: default_monitor_interval(),
            attempts: default_probe_attempts(),
            attempt_spacing_ms: default_attempt_spacing(),
            attempt_timeout_ms: default_attempt_timeout(),
            failure_threshold: default_failure_threshold(),
            backoff: BackoffKind::default(),
            max_backoff_secs: default_max_backoff(),
            terminate: TerminateTarget::default(),
            health_path: default_health_path(),
            peer_port: default_unit_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrationConfig {
    /// Public domain suffix; frontends are registered as "<name>.<domain>"
    pub domain: Option<String>,

    /// Record TTL in seconds (default: 60)
    #[serde(default = "default_record_ttl")]
    pub ttl_secs: u32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            domain: None,
            ttl_secs: default_record_ttl(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_store_path() -> PathBuf {
    PathBuf::from("wakegate.db")
}

fn default_pool() -> String {
    "default".to_string()
}

fn default_network() -> String {
    "wakegate".to_string()
}

fn default_unit_port() -> u16 {
    8080
}

fn default_launch_lease_ttl() -> u64 {
    900
}

fn default_capacity_wait() -> u64 {
    180
}

fn default_capacity_retries() -> u32 {
    3
}

fn default_capacity_backoff() -> u64 {
    10
}

fn default_running_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    3
}

fn default_reachability_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    900
}

fn default_fleet_id() -> String {
    "local".to_string()
}

fn default_max_units_per_host() -> u32 {
    3
}

fn default_fleet_lease_ttl() -> u64 {
    300
}

fn default_fleet_schedule() -> u64 {
    6 * 60 * 60
}

fn default_frontend_grace() -> u64 {
    600
}

fn default_backend_grace() -> u64 {
    60
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_probe_attempts() -> u32 {
    5
}

fn default_attempt_spacing() -> u64 {
    1000
}

fn default_attempt_timeout() -> u64 {
    2500
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_max_backoff() -> u64 {
    30
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_record_ttl() -> u32 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WAKEGATE_*` overrides. Unknown variables are ignored; a
    /// recognized variable with an unparsable value is an error.
    pub fn apply_env<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut errors = Vec::new();

        for (key, value) in vars {
            let Some(knob) = key.strip_prefix("WAKEGATE_") else {
                continue;
            };
            if let Err(e) = self.apply_override(knob, &value) {
                errors.push(format!("{}: {}", key, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid environment overrides:\n  - {}", errors.join("\n  - "));
        }
        self.validate()
    }

    fn apply_override(&mut self, knob: &str, value: &str) -> Result<(), String> {
        fn num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
            value.parse().map_err(|_| format!("'{}' is not a valid number", value))
        }

        match knob {
            "BIND" => self.server.bind = value.to_string(),
            "PORT" => self.server.port = num(value)?,
            "STORE_PATH" => self.store.path = PathBuf::from(value),
            "POOL" => self.provisioning.pool = value.to_string(),
            "DOCKER_HOST" => self.provisioning.docker_host = Some(value.to_string()),
            "NETWORK" => self.provisioning.network = value.to_string(),
            "FRONTEND_TEMPLATE" => self.templates.frontend.id = value.to_string(),
            "BACKEND_TEMPLATE" => self.templates.backend.id = value.to_string(),
            "FRONTEND_CONTAINER" => self.templates.frontend.container = Some(value.to_string()),
            "BACKEND_CONTAINER" => self.templates.backend.container = Some(value.to_string()),
            "FLEET_ID" => self.fleet.fleet_id = value.to_string(),
            "MAX_UNITS_PER_HOST" => self.fleet.max_units_per_host = num(value)?,
            "DOMAIN" => self.registration.domain = Some(value.to_string()),
            "LAUNCH_LEASE_TTL_SECS" => self.launch.lease_ttl_secs = num(value)?,
            "FLEET_LEASE_TTL_SECS" => self.fleet.lease_ttl_secs = num(value)?,
            "CAPACITY_WAIT_SECS" => self.launch.capacity_wait_secs = num(value)?,
            "RUNNING_TIMEOUT_SECS" => self.launch.running_timeout_secs = num(value)?,
            "POLL_INTERVAL_SECS" => self.launch.poll_interval_secs = num(value)?,
            "REQUEST_TIMEOUT_SECS" => self.launch.request_timeout_secs = num(value)?,
            "FRONTEND_GRACE_SECS" => self.monitor.frontend_grace_secs = num(value)?,
            "BACKEND_GRACE_SECS" => self.monitor.backend_grace_secs = num(value)?,
            "FAILURE_THRESHOLD" => self.monitor.failure_threshold = num(value)?,
            // Variables handed to units at creation share the prefix
            _ => {}
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for role in [Role::Frontend, Role::Backend] {
            errors.extend(self.templates.for_role(role).validate(role));
        }

        if self.provisioning.pool.is_empty() {
            errors.push("provisioning: 'pool' must not be empty".to_string());
        }
        if self.fleet.max_units_per_host == 0 {
            errors.push("fleet: 'max_units_per_host' must be at least 1".to_string());
        }
        if self.launch.poll_interval_secs == 0 {
            errors.push("launch: 'poll_interval_secs' must be non-zero".to_string());
        }
        if self.launch.lease_ttl_secs < self.launch.request_timeout_secs {
            errors.push(format!(
                "launch: 'lease_ttl_secs' ({}) must cover 'request_timeout_secs' ({})",
                self.launch.lease_ttl_secs, self.launch.request_timeout_secs
            ));
        }
        if self.monitor.failure_threshold == 0 {
            errors.push("monitor: 'failure_threshold' must be at least 1".to_string());
        }
        if self.monitor.attempts == 0 {
            errors.push("monitor: 'attempts' must be at least 1".to_string());
        }
        if self.registration.ttl_secs == 0 || self.registration.ttl_secs > 60 {
            errors.push("registration: 'ttl_secs' must be between 1 and 60".to_string());
        }
        if let Some(domain) = &self.registration.domain {
            if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
                errors.push(format!("registration: invalid domain '{}'", domain));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
