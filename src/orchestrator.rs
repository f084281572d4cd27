//! Launch orchestrator
//!
//! Brings up the backend and frontend of a workload on request. Concurrent
//! requests for one name are coalesced through the launch lease: the first
//! caller launches, everyone else is told the workload is starting.

use crate::clock::SharedClock;
use crate::config::{Config, LaunchConfig, TemplatesConfig};
use crate::error::LaunchError;
use crate::fleet::FleetController;
use crate::lease::{LeaseGuard, LeaseKey, LeaseOutcome, SharedLeaseStore};
use crate::name::{Role, WorkloadName};
use crate::poll::{poll_until, PollPolicy};
use crate::provider::{
    describe_live_units, match_by_metadata, SharedProber, SharedProvisioner, UnitDetail, UnitOverrides, UnitRef,
    UnitStatus, ENV_BACKEND_ADDRESS,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-probe timeout of the reachability wait
const REACHABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses of one running endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub unit: UnitRef,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

impl EndpointInfo {
    fn from_unit(unit: &UnitDetail) -> Option<Self> {
        Some(Self {
            unit: unit.id.clone(),
            address: unit.address.clone()?,
            public_address: unit.public_address.clone(),
        })
    }
}

/// Both endpoints of a running workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadEndpoints {
    pub frontend: EndpointInfo,
    pub backend: EndpointInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Ready(WorkloadEndpoints),
    /// Another caller holds the launch lease
    Starting,
}

/// Result of a read-only status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Ready(WorkloadEndpoints),
    /// A launch is in flight or an endpoint is not healthy yet
    Starting,
    /// Nothing is running and nobody is launching
    Stopped,
}

pub struct Launcher {
    provisioner: SharedProvisioner,
    leases: SharedLeaseStore,
    fleet: Arc<FleetController>,
    prober: SharedProber,
    clock: SharedClock,
    pool: String,
    templates: TemplatesConfig,
    settings: LaunchConfig,
    domain: Option<String>,
}

impl Launcher {
    pub fn new(
        config: &Config,
        provisioner: SharedProvisioner,
        leases: SharedLeaseStore,
        fleet: Arc<FleetController>,
        prober: SharedProber,
        clock: SharedClock,
    ) -> Self {
        Self {
            provisioner,
            leases,
            fleet,
            prober,
            clock,
            pool: config.provisioning.pool.clone(),
            templates: config.templates.clone(),
            settings: config.launch.clone(),
            domain: config.registration.domain.clone(),
        }
    }

    /// Public URL of the workload's frontend, if a domain is configured
    pub fn public_url(&self, name: &WorkloadName) -> Option<String> {
        self.domain.as_ref().map(|domain| format!("http://{}.{}/", name, domain))
    }

    /// Launch the workload, or report it ready if it already runs.
    ///
    /// The whole request is bounded by the request ceiling; when it elapses the
    /// launch lease is released on behalf of this request. Dropping the
    /// returned future mid-launch releases the lease as well.
    pub async fn launch(&self, raw_name: &str) -> Result<LaunchOutcome, LaunchError> {
        let name = WorkloadName::parse(raw_name)?;
        let key = LeaseKey::Launch(name.clone());
        let holder = Uuid::new_v4().to_string();
        let ceiling = self.settings.request_timeout();

        match tokio::time::timeout(ceiling, self.launch_inner(&name, &key, &holder)).await {
            Ok(result) => result,
            Err(_) => {
                error!(workload = %name, ceiling_secs = ceiling.as_secs(), "Launch request hit its ceiling");
                self.leases.release(&key, &holder).await;
                Err(LaunchError::Timeout {
                    what: format!("launch of {}", name),
                    waited: ceiling,
                })
            }
        }
    }

    async fn launch_inner(
        &self,
        name: &WorkloadName,
        key: &LeaseKey,
        holder: &str,
    ) -> Result<LaunchOutcome, LaunchError> {
        let units = describe_live_units(self.provisioner.as_ref(), &self.pool).await?;
        if let Some(endpoints) = self.ready_endpoints(&units, name) {
            debug!(workload = %name, "Workload already running");
            return Ok(LaunchOutcome::Ready(endpoints));
        }

        let outcome = self
            .leases
            .acquire(key, holder, self.settings.lease_ttl())
            .await
            .map_err(LaunchError::Lease)?;
        if let LeaseOutcome::InProgress = outcome {
            info!(workload = %name, "Launch already in progress");
            return Ok(LaunchOutcome::Starting);
        }
        let guard = LeaseGuard::new(Arc::clone(&self.leases), key.clone(), holder);

        let result = self.launch_locked(name).await;
        // Released before the reachability wait so slow name propagation
        // cannot keep the lease held
        guard.release().await;

        let endpoints = match result {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(workload = %name, error = %e, "Launch failed");
                return Err(e);
            }
        };

        self.wait_reachable(name).await;
        Ok(LaunchOutcome::Ready(endpoints))
    }

    async fn launch_locked(&self, name: &WorkloadName) -> Result<WorkloadEndpoints, LaunchError> {
        // Another caller may have finished between the fast path and the lease
        let units = describe_live_units(self.provisioner.as_ref(), &self.pool).await?;
        if let Some(endpoints) = self.ready_endpoints(&units, name) {
            info!(workload = %name, "Workload was launched by another request");
            return Ok(endpoints);
        }

        let backend = match match_by_metadata(&units, name.as_str(), Role::Backend) {
            Some(existing) => {
                debug!(workload = %name, unit = %existing.id, "Reusing existing backend");
                self.wait_for_running(Role::Backend, &existing.id).await?
            }
            None => {
                self.fleet
                    .ensure_capacity(self.settings.capacity_wait(), self.settings.poll_interval())
                    .await?;
                let id = self.create_backend(name).await?;
                self.wait_for_running(Role::Backend, &id).await?
            }
        };
        let backend_info = EndpointInfo::from_unit(&backend).ok_or_else(|| LaunchError::UnitStopped {
            role: Role::Backend,
            unit: backend.id.clone(),
        })?;

        let frontend = match match_by_metadata(&units, name.as_str(), Role::Frontend) {
            Some(existing) => {
                debug!(workload = %name, unit = %existing.id, "Reusing existing frontend");
                self.wait_for_running(Role::Frontend, &existing.id).await?
            }
            None => {
                let id = self.create_frontend(name, &backend_info.address).await?;
                self.wait_for_running(Role::Frontend, &id).await?
            }
        };
        let frontend_info = EndpointInfo::from_unit(&frontend).ok_or_else(|| LaunchError::UnitStopped {
            role: Role::Frontend,
            unit: frontend.id.clone(),
        })?;

        info!(
            workload = %name,
            backend = %backend_info.address,
            frontend = %frontend_info.address,
            "Workload launched"
        );

        Ok(WorkloadEndpoints {
            frontend: frontend_info,
            backend: backend_info,
            public_url: self.public_url(name),
        })
    }

    /// Create the backend, scaling the fleet by one host after each capacity
    /// failure until the retry budget is spent.
    async fn create_backend(&self, name: &WorkloadName) -> Result<UnitRef, LaunchError> {
        let template = &self.templates.backend;
        let overrides = UnitOverrides::for_endpoint(name, Role::Backend, template.container.clone());
        let mut retries = 0u32;

        loop {
            match self.provisioner.create_unit(&self.pool, &template.id, &overrides).await {
                Ok(id) => {
                    info!(workload = %name, unit = %id, "Backend unit created");
                    return Ok(id);
                }
                Err(e) if e.is_capacity() => {
                    if retries >= self.settings.capacity_retries {
                        return Err(LaunchError::CapacityExhausted {
                            attempts: retries + 1,
                            reason: e.to_string(),
                        });
                    }
                    retries += 1;
                    warn!(
                        workload = %name,
                        attempt = retries,
                        reason = %e,
                        "Insufficient capacity, adding a host before retrying"
                    );
                    self.fleet.add_host().await?;
                    self.clock.sleep(self.settings.capacity_backoff()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn create_frontend(&self, name: &WorkloadName, backend_address: &str) -> Result<UnitRef, LaunchError> {
        let template = &self.templates.frontend;
        let mut overrides = UnitOverrides::for_endpoint(name, Role::Frontend, template.container.clone());
        overrides
            .env
            .insert(ENV_BACKEND_ADDRESS.to_string(), backend_address.to_string());

        let id = self.provisioner.create_unit(&self.pool, &template.id, &overrides).await?;
        info!(workload = %name, unit = %id, backend = backend_address, "Frontend unit created");
        Ok(id)
    }

    /// Wait until the unit runs with an address. A unit that stops first fails the launch.
    async fn wait_for_running(&self, role: Role, unit: &str) -> Result<UnitDetail, LaunchError> {
        let refs = vec![unit.to_string()];
        let what = format!("{} unit {} to run", role, unit);

        let detail = poll_until(
            self.clock.as_ref(),
            PollPolicy::deadline(self.settings.poll_interval(), self.settings.running_timeout()),
            &what,
            || async {
                let details = self.provisioner.describe_units(&self.pool, &refs).await?;
                Ok::<_, anyhow::Error>(
                    details
                        .into_iter()
                        .find(|d| d.id == unit)
                        .filter(|d| d.is_running() || d.status == UnitStatus::Stopped),
                )
            },
        )
        .await?;

        if detail.status == UnitStatus::Stopped {
            return Err(LaunchError::UnitStopped {
                role,
                unit: unit.to_string(),
            });
        }
        debug!(role = %role, unit, "Unit running");
        Ok(detail)
    }

    /// Wait for the frontend to answer on its public name. Never fails: name
    /// propagation may lag, and clients keep polling.
    async fn wait_reachable(&self, name: &WorkloadName) {
        let Some(url) = self.public_url(name) else {
            return;
        };

        let result = poll_until(
            self.clock.as_ref(),
            PollPolicy::deadline(self.settings.poll_interval(), self.settings.reachability_timeout()),
            "frontend to be reachable",
            || async {
                Ok::<_, anyhow::Error>(
                    self.prober
                        .probe(&url, REACHABILITY_PROBE_TIMEOUT)
                        .await
                        .then_some(()),
                )
            },
        )
        .await;

        match result {
            Ok(()) => debug!(workload = %name, url, "Frontend reachable"),
            Err(e) => warn!(workload = %name, url, error = %e, "Frontend not reachable yet, reporting ready"),
        }
    }

    fn ready_endpoints(&self, units: &[UnitDetail], name: &WorkloadName) -> Option<WorkloadEndpoints> {
        let frontend = match_by_metadata(units, name.as_str(), Role::Frontend).filter(|u| u.is_ready())?;
        let backend = match_by_metadata(units, name.as_str(), Role::Backend).filter(|u| u.is_ready())?;
        Some(WorkloadEndpoints {
            frontend: EndpointInfo::from_unit(frontend)?,
            backend: EndpointInfo::from_unit(backend)?,
            public_url: self.public_url(name),
        })
    }

    /// Read-only status check, no lease and no launch
    pub async fn status(&self, raw_name: &str) -> Result<WorkloadStatus, LaunchError> {
        let name = WorkloadName::parse(raw_name)?;
        let units = describe_live_units(self.provisioner.as_ref(), &self.pool).await?;

        if let Some(endpoints) = self.ready_endpoints(&units, &name) {
            return Ok(WorkloadStatus::Ready(endpoints));
        }

        let has_endpoint = match_by_metadata(&units, name.as_str(), Role::Frontend).is_some()
            || match_by_metadata(&units, name.as_str(), Role::Backend).is_some();
        let launching = self
            .leases
            .is_held(&LeaseKey::Launch(name))
            .await
            .map_err(LaunchError::Lease)?;

        if has_endpoint || launching {
            Ok(WorkloadStatus::Starting)
        } else {
            Ok(WorkloadStatus::Stopped)
        }
    }
}
