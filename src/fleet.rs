//! Compute fleet controller
//!
//! Derives the number of compute hosts the backend units need and which hosts
//! must be protected from scale-in. Every evaluation re-reads the full state,
//! so running it twice on unchanged inputs changes nothing.

use crate::clock::SharedClock;
use crate::config::FleetConfig;
use crate::error::{LaunchError, ProvisionError};
use crate::lease::{LeaseKey, LeaseOutcome, SharedLeaseStore};
use crate::name::Role;
use crate::poll::{poll_until, PollPolicy};
use crate::provider::{
    describe_active_hosts, describe_live_units, HostDetail, SharedFleetApi, SharedProvisioner, UnitDetail,
    UnitStatus,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity change decided by an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "hosts", rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaleTo(u32),
    NoChange,
}

/// Outcome of a fleet evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetPlan {
    /// Backend units running or pending
    pub total_units: u32,
    /// Active hosts in the pool
    pub current_hosts: u32,
    /// Active hosts without any backend unit
    pub empty_hosts: u32,
    /// Hosts needed to fit every unit
    pub required: u32,
    /// Fleet instance ids that host at least one unit
    pub protect: Vec<String>,
    /// Fleet instance ids that host nothing
    pub unprotect: Vec<String>,
    pub decision: ScaleDecision,
}

impl FleetPlan {
    /// Host count the fleet should end up at
    pub fn desired_capacity(&self) -> u32 {
        match self.decision {
            ScaleDecision::ScaleTo(n) => n,
            ScaleDecision::NoChange => self.current_hosts,
        }
    }
}

/// Compute the plan for the given units and hosts.
///
/// Only backend units that are running or pending count, since pending units
/// are about to occupy capacity. Only active hosts count.
pub fn plan(units: &[UnitDetail], hosts: &[HostDetail], max_units_per_host: u32) -> FleetPlan {
    let max = max_units_per_host.max(1);

    let backend_units: Vec<&UnitDetail> = units
        .iter()
        .filter(|u| u.role() == Some(Role::Backend))
        .filter(|u| matches!(u.status, UnitStatus::Running | UnitStatus::Pending))
        .collect();
    let active_hosts: Vec<&HostDetail> = hosts.iter().filter(|h| h.active).collect();

    let total_units = backend_units.len() as u32;
    let current_hosts = active_hosts.len() as u32;
    let required = total_units.div_ceil(max);

    if active_hosts.is_empty() {
        let decision = if required > 0 {
            ScaleDecision::ScaleTo(required)
        } else {
            ScaleDecision::NoChange
        };
        return FleetPlan {
            total_units,
            current_hosts,
            empty_hosts: 0,
            required,
            protect: Vec::new(),
            unprotect: Vec::new(),
            decision,
        };
    }

    let mut per_host: BTreeMap<&str, u32> = active_hosts.iter().map(|h| (h.id.as_str(), 0)).collect();
    for unit in &backend_units {
        if let Some(count) = unit.host.as_deref().and_then(|h| per_host.get_mut(h)) {
            *count += 1;
        }
    }

    let mut protect = Vec::new();
    let mut unprotect = Vec::new();
    for host in &active_hosts {
        let instance = host.instance_id.clone().unwrap_or_else(|| host.id.clone());
        if per_host.get(host.id.as_str()).copied().unwrap_or(0) > 0 {
            protect.push(instance);
        } else {
            unprotect.push(instance);
        }
    }
    protect.sort();
    unprotect.sort();

    let empty_hosts = unprotect.len() as u32;
    let occupied = current_hosts - empty_hosts;

    let decision = if required > current_hosts {
        ScaleDecision::ScaleTo(required)
    } else if empty_hosts > 0 && total_units <= occupied * max {
        ScaleDecision::ScaleTo(required.max(occupied))
    } else {
        ScaleDecision::NoChange
    };

    FleetPlan {
        total_units,
        current_hosts,
        empty_hosts,
        required,
        protect,
        unprotect,
        decision,
    }
}

pub struct FleetController {
    provisioner: SharedProvisioner,
    fleet_api: SharedFleetApi,
    leases: SharedLeaseStore,
    clock: SharedClock,
    pool: String,
    config: FleetConfig,
}

impl FleetController {
    pub fn new(
        provisioner: SharedProvisioner,
        fleet_api: SharedFleetApi,
        leases: SharedLeaseStore,
        clock: SharedClock,
        pool: String,
        config: FleetConfig,
    ) -> Self {
        Self {
            provisioner,
            fleet_api,
            leases,
            clock,
            pool,
            config,
        }
    }

    /// Run one lease-protected evaluation. Returns `None` when another
    /// evaluation holds the lease.
    pub async fn evaluate(&self) -> anyhow::Result<Option<FleetPlan>> {
        let holder = Uuid::new_v4().to_string();
        let key = LeaseKey::FleetEvaluation;

        match self.leases.acquire(&key, &holder, self.config.lease_ttl()).await? {
            LeaseOutcome::Granted(_) => {}
            LeaseOutcome::InProgress => {
                debug!("Fleet evaluation already in progress, skipping");
                return Ok(None);
            }
        }

        let result = self.evaluate_locked().await;
        self.leases.release(&key, &holder).await;
        result.map(Some)
    }

    async fn evaluate_locked(&self) -> anyhow::Result<FleetPlan> {
        let units = describe_live_units(self.provisioner.as_ref(), &self.pool).await?;
        let hosts = describe_active_hosts(self.provisioner.as_ref(), &self.pool).await?;
        let plan = plan(&units, &hosts, self.config.max_units_per_host);

        debug!(
            units = plan.total_units,
            hosts = plan.current_hosts,
            empty = plan.empty_hosts,
            required = plan.required,
            "Fleet evaluated"
        );

        self.apply(&plan).await?;
        Ok(plan)
    }

    /// Protection is applied before any capacity change, so a host that just
    /// received a unit cannot be picked for removal.
    async fn apply(&self, plan: &FleetPlan) -> Result<(), ProvisionError> {
        let fleet_id = &self.config.fleet_id;
        let fleet = self.fleet_api.describe_fleet(fleet_id).await?;

        let known: HashSet<&str> = fleet.instances.iter().map(|i| i.id.as_str()).collect();
        let protected: HashSet<&str> = fleet
            .instances
            .iter()
            .filter(|i| i.protected)
            .map(|i| i.id.as_str())
            .collect();

        let to_protect: Vec<String> = plan
            .protect
            .iter()
            .filter(|id| known.contains(id.as_str()) && !protected.contains(id.as_str()))
            .cloned()
            .collect();
        let to_unprotect: Vec<String> = plan
            .unprotect
            .iter()
            .filter(|id| protected.contains(id.as_str()))
            .cloned()
            .collect();

        if !to_protect.is_empty() {
            info!(instances = ?to_protect, "Protecting occupied hosts from scale-in");
            self.fleet_api.set_instance_protection(fleet_id, &to_protect, true).await?;
        }
        if !to_unprotect.is_empty() {
            info!(instances = ?to_unprotect, "Removing scale-in protection from empty hosts");
            self.fleet_api.set_instance_protection(fleet_id, &to_unprotect, false).await?;
        }

        if let ScaleDecision::ScaleTo(target) = plan.decision {
            let target = target.min(fleet.max);
            if target != fleet.desired {
                info!(from = fleet.desired, to = target, "Setting fleet desired capacity");
                self.fleet_api.set_desired_capacity(fleet_id, target).await?;
            }
        }

        Ok(())
    }

    async fn has_available_host(&self) -> Result<bool, ProvisionError> {
        let hosts = describe_active_hosts(self.provisioner.as_ref(), &self.pool).await?;
        Ok(hosts.iter().any(HostDetail::is_available))
    }

    /// Make sure at least one connected host is in the pool, growing the fleet
    /// from zero and waiting up to `wait` for a host to join.
    pub async fn ensure_capacity(&self, wait: Duration, interval: Duration) -> Result<(), LaunchError> {
        if self.has_available_host().await? {
            return Ok(());
        }

        let fleet_id = &self.config.fleet_id;
        let fleet = self.fleet_api.describe_fleet(fleet_id).await?;
        if fleet.desired == 0 {
            info!(fleet_id, "No compute hosts, scaling fleet up from zero");
            self.fleet_api.set_desired_capacity(fleet_id, 1).await?;
        }

        poll_until(
            self.clock.as_ref(),
            PollPolicy::deadline(interval, wait),
            "compute host to join the pool",
            || async { Ok::<_, anyhow::Error>(self.has_available_host().await?.then_some(())) },
        )
        .await?;

        info!(fleet_id, "Compute host available");
        Ok(())
    }

    /// Request one more host. Returns false if the fleet is already at its maximum.
    pub async fn add_host(&self) -> Result<bool, ProvisionError> {
        let fleet_id = &self.config.fleet_id;
        let fleet = self.fleet_api.describe_fleet(fleet_id).await?;
        if fleet.desired >= fleet.max {
            warn!(fleet_id, desired = fleet.desired, max = fleet.max, "Fleet already at maximum size");
            return Ok(false);
        }
        info!(fleet_id, to = fleet.desired + 1, "Adding a compute host");
        self.fleet_api.set_desired_capacity(fleet_id, fleet.desired + 1).await?;
        Ok(true)
    }

    async fn evaluate_logged(&self) {
        match self.evaluate().await {
            Ok(Some(plan)) => debug!(desired = plan.desired_capacity(), "Fleet evaluation complete"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Fleet evaluation failed"),
        }
    }

    /// Evaluate at startup, on every trigger, and on the configured schedule.
    /// Triggers that arrive during an evaluation are coalesced into one run.
    pub async fn run(&self, mut triggers: mpsc::Receiver<()>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(schedule_secs = self.config.schedule_secs, "Fleet controller started");
        self.evaluate_logged().await;

        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.schedule()) => {
                    debug!("Scheduled fleet evaluation");
                }
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        info!("Fleet trigger channel closed");
                        break;
                    }
                    while triggers.try_recv().is_ok() {}
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Fleet controller shutting down");
                        break;
                    }
                    continue;
                }
            }
            self.evaluate_logged().await;
        }
    }
}
