//! Interfaces of the external collaborators: the provisioning API, the fleet
//! sizing API, the name registry and the peer prober.
//!
//! Units are associated with workloads purely through metadata attached at
//! creation time; [`match_by_metadata`] is the only place that join happens.

use crate::db::{Database, NameRecord};
use crate::error::ProvisionError;
use crate::name::{Role, WorkloadName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Metadata key carrying the workload name of a unit
pub const WORKLOAD_KEY: &str = "wakegate.workload";
/// Metadata key carrying the role of a unit
pub const ROLE_KEY: &str = "wakegate.role";

/// Environment variables handed to every unit at creation
pub const ENV_WORKLOAD: &str = "WAKEGATE_WORKLOAD";
pub const ENV_ROLE: &str = "WAKEGATE_ROLE";
/// Private address of the backend, handed to the frontend so its relay
/// targets that unit directly
pub const ENV_BACKEND_ADDRESS: &str = "WAKEGATE_BACKEND_ADDRESS";

/// Opaque reference to a unit in the provisioning system
pub type UnitRef = String;
/// Opaque reference to a compute host in the provisioning system
pub type HostRef = String;

/// Lifecycle status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Running,
    Stopped,
    Unknown,
}

/// Health of a unit as reported by the provisioning system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Filter for [`Provisioner::list_units`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredStatus {
    /// Units meant to be running, including those still pending
    Running,
    /// Units that are stopping or stopped
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDetail {
    pub id: UnitRef,
    pub status: UnitStatus,
    pub health: HealthStatus,
    /// Private address, present once placement completes
    pub address: Option<String>,
    /// Public address, for units that have one
    pub public_address: Option<String>,
    /// Host the unit is placed on
    pub host: Option<HostRef>,
    /// Metadata attached at creation
    pub metadata: BTreeMap<String, String>,
}

impl UnitDetail {
    pub fn workload(&self) -> Option<&str> {
        self.metadata.get(WORKLOAD_KEY).map(String::as_str)
    }

    pub fn role(&self) -> Option<Role> {
        self.metadata.get(ROLE_KEY).and_then(|r| r.parse().ok())
    }

    /// Running with an address
    pub fn is_running(&self) -> bool {
        self.status == UnitStatus::Running && self.address.is_some()
    }

    /// Running, placed and reported healthy
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.health == HealthStatus::Healthy
    }
}

/// Per-request settings for [`Provisioner::create_unit`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOverrides {
    /// Container within the template the overrides apply to
    pub container: Option<String>,
    /// Metadata attached to the unit, used to re-associate it later
    pub metadata: BTreeMap<String, String>,
    /// Extra environment for the container
    pub env: BTreeMap<String, String>,
}

impl UnitOverrides {
    /// Overrides tagging a unit with its workload and role
    pub fn for_endpoint(name: &WorkloadName, role: Role, container: Option<String>) -> Self {
        let mut overrides = Self {
            container,
            ..Default::default()
        };
        overrides.metadata.insert(WORKLOAD_KEY.to_string(), name.to_string());
        overrides.metadata.insert(ROLE_KEY.to_string(), role.to_string());
        overrides.env.insert(ENV_WORKLOAD.to_string(), name.to_string());
        overrides.env.insert(ENV_ROLE.to_string(), role.to_string());
        overrides
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDetail {
    pub id: HostRef,
    /// Registered and accepting placements
    pub active: bool,
    /// Agent connected to the provisioning system
    pub connected: bool,
    /// Instance id in the fleet sizing API, used for scale-in protection
    pub instance_id: Option<String>,
}

impl HostDetail {
    /// Joined the pool and can take units
    pub fn is_available(&self) -> bool {
        self.active && self.connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetInstance {
    pub id: String,
    pub lifecycle_state: String,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetDescription {
    pub desired: u32,
    pub max: u32,
    pub instances: Vec<FleetInstance>,
}

/// Creates and inspects units and hosts
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn list_units(&self, pool: &str, desired: DesiredStatus) -> Result<Vec<UnitRef>, ProvisionError>;

    async fn describe_units(&self, pool: &str, units: &[UnitRef]) -> Result<Vec<UnitDetail>, ProvisionError>;

    async fn create_unit(
        &self,
        pool: &str,
        template: &str,
        overrides: &UnitOverrides,
    ) -> Result<UnitRef, ProvisionError>;

    async fn list_hosts(&self, pool: &str) -> Result<Vec<HostRef>, ProvisionError>;

    async fn describe_hosts(&self, pool: &str, hosts: &[HostRef]) -> Result<Vec<HostDetail>, ProvisionError>;
}

/// Sizes the group of machines backing the compute hosts
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn describe_fleet(&self, fleet_id: &str) -> Result<FleetDescription, ProvisionError>;

    async fn set_desired_capacity(&self, fleet_id: &str, desired: u32) -> Result<(), ProvisionError>;

    async fn set_instance_protection(
        &self,
        fleet_id: &str,
        instance_ids: &[String],
        protected: bool,
    ) -> Result<(), ProvisionError>;
}

/// Stores discoverable address records
#[async_trait]
pub trait NameRegistry: Send + Sync {
    async fn upsert(&self, record: &NameRecord) -> anyhow::Result<()>;

    /// Delete the record if `unit` still owns it. Returns false otherwise.
    async fn delete(&self, name: &str, unit: &str) -> anyhow::Result<bool>;

    async fn lookup(&self, prefix: &str) -> anyhow::Result<Vec<NameRecord>>;
}

/// Checks whether an HTTP endpoint answers
#[async_trait]
pub trait Prober: Send + Sync {
    /// True on a 2xx or 3xx response within `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

pub type SharedProvisioner = Arc<dyn Provisioner>;
pub type SharedFleetApi = Arc<dyn FleetApi>;
pub type SharedNameRegistry = Arc<dyn NameRegistry>;
pub type SharedProber = Arc<dyn Prober>;

#[async_trait]
impl NameRegistry for Database {
    async fn upsert(&self, record: &NameRecord) -> anyhow::Result<()> {
        self.upsert_name_record(record)
    }

    async fn delete(&self, name: &str, unit: &str) -> anyhow::Result<bool> {
        self.delete_name_record(name, unit)
    }

    async fn lookup(&self, prefix: &str) -> anyhow::Result<Vec<NameRecord>> {
        self.find_name_records(prefix)
    }
}

/// Find the unit of `role` belonging to workload `name`.
///
/// The name is validated before it is compared against any metadata, so a
/// malformed name can never match another workload's units. Stopped units
/// are ignored, and a running unit wins over a pending one.
pub fn match_by_metadata<'a>(units: &'a [UnitDetail], name: &str, role: Role) -> Option<&'a UnitDetail> {
    let name = WorkloadName::parse(name).ok()?;

    let mut candidates = units.iter().filter(|unit| {
        unit.status != UnitStatus::Stopped
            && unit.workload() == Some(name.as_str())
            && unit.role() == Some(role)
    });

    let first = candidates.next()?;
    if first.status == UnitStatus::Running {
        return Some(first);
    }
    candidates
        .find(|unit| unit.status == UnitStatus::Running)
        .or(Some(first))
}

/// List and describe every live unit in the pool
pub async fn describe_live_units(
    provisioner: &dyn Provisioner,
    pool: &str,
) -> Result<Vec<UnitDetail>, ProvisionError> {
    let refs = provisioner.list_units(pool, DesiredStatus::Running).await?;
    if refs.is_empty() {
        return Ok(Vec::new());
    }
    provisioner.describe_units(pool, &refs).await
}

/// List and describe every active host in the pool
pub async fn describe_active_hosts(
    provisioner: &dyn Provisioner,
    pool: &str,
) -> Result<Vec<HostDetail>, ProvisionError> {
    let refs = provisioner.list_hosts(pool).await?;
    if refs.is_empty() {
        return Ok(Vec::new());
    }
    let hosts = provisioner.describe_hosts(pool, &refs).await?;
    Ok(hosts.into_iter().filter(|h| h.active).collect())
}
