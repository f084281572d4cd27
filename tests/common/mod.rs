//! In-memory provisioning fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wakegate::clock::{Clock, ManualClock};
use wakegate::error::ProvisionError;
use wakegate::monitor::Terminator;
use wakegate::name::Role;
use wakegate::provider::{
    DesiredStatus, FleetApi, FleetDescription, FleetInstance, HealthStatus, HostDetail, HostRef, Prober,
    Provisioner, UnitDetail, UnitOverrides, UnitRef, UnitStatus, ROLE_KEY, WORKLOAD_KEY,
};

pub const FLEET_ID: &str = "test-fleet";

/// What a created unit does after its first describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitFate {
    #[default]
    Runs,
    StaysPending,
    Stops,
}

struct SimUnit {
    detail: UnitDetail,
    describes: u32,
    fate: UnitFate,
}

#[derive(Default)]
struct SimState {
    units: Vec<SimUnit>,
    hosts: Vec<HostDetail>,
    next_host: u32,
    desired: u32,
    max: u32,
    protected: HashSet<String>,
    capacity_failures: VecDeque<String>,
    fates: HashMap<Role, UnitFate>,
    hang_creates: bool,
    hosts_frozen: bool,
    backends_created: u32,
    frontends_created: u32,
    create_calls: u32,
    set_desired_calls: u32,
    protection_calls: u32,
}

impl SimState {
    fn add_host(&mut self) {
        self.next_host += 1;
        self.hosts.push(HostDetail {
            id: format!("host-{}", self.next_host),
            active: true,
            connected: true,
            instance_id: Some(format!("i-{}", self.next_host)),
        });
    }

    fn units_on(&self, host: &str) -> usize {
        self.units
            .iter()
            .filter(|u| u.detail.status != UnitStatus::Stopped && u.detail.host.as_deref() == Some(host))
            .count()
    }
}

/// A provisioning system and fleet API in one.
///
/// Created units report Pending on their first describe and Running with an
/// address afterwards. Raising the desired capacity joins hosts at once;
/// lowering it removes unprotected empty hosts.
pub struct SimCloud {
    state: Mutex<SimState>,
}

impl SimCloud {
    pub fn new(hosts: u32, max: u32) -> Arc<Self> {
        let mut state = SimState {
            desired: hosts,
            max,
            ..Default::default()
        };
        for _ in 0..hosts {
            state.add_host();
        }
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Fail the next creates with these provider reasons
    pub fn fail_creates_with(&self, reasons: &[&str]) {
        let mut state = self.state.lock();
        state.capacity_failures.extend(reasons.iter().map(|r| r.to_string()));
    }

    /// Place an already running backend on `host`
    pub fn add_running_backend(&self, workload: &str, host: &str) -> UnitRef {
        let mut state = self.state.lock();
        let seq = state.units.len() + 1;
        let id = format!("seed-{}", seq);
        let mut metadata = BTreeMap::new();
        metadata.insert(WORKLOAD_KEY.to_string(), workload.to_string());
        metadata.insert(ROLE_KEY.to_string(), Role::Backend.to_string());
        state.units.push(SimUnit {
            detail: UnitDetail {
                id: id.clone(),
                status: UnitStatus::Running,
                health: HealthStatus::Healthy,
                address: Some(format!("10.0.9.{}", seq)),
                public_address: None,
                host: Some(host.to_string()),
                metadata,
            },
            describes: 1,
            fate: UnitFate::Runs,
        });
        id
    }

    /// Units of `role` created from now on end up in `fate`
    pub fn set_fate(&self, role: Role, fate: UnitFate) {
        self.state.lock().fates.insert(role, fate);
    }

    /// Creates never return
    pub fn hang_creates(&self) {
        self.state.lock().hang_creates = true;
    }

    /// Capacity changes are recorded but no host joins or leaves
    pub fn freeze_hosts(&self) {
        self.state.lock().hosts_frozen = true;
    }

    pub fn stop_unit(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(unit) = state.units.iter_mut().find(|u| u.detail.id == id) {
            unit.detail.status = UnitStatus::Stopped;
        }
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    pub fn units_created(&self, role: Role) -> u32 {
        let state = self.state.lock();
        match role {
            Role::Backend => state.backends_created,
            Role::Frontend => state.frontends_created,
        }
    }

    pub fn desired(&self) -> u32 {
        self.state.lock().desired
    }

    pub fn host_count(&self) -> usize {
        self.state.lock().hosts.len()
    }

    pub fn set_desired_calls(&self) -> u32 {
        self.state.lock().set_desired_calls
    }

    pub fn protection_calls(&self) -> u32 {
        self.state.lock().protection_calls
    }

    pub fn protected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().protected.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Env the unit was created with, by unit id
    pub fn unit(&self, id: &str) -> Option<UnitDetail> {
        self.state
            .lock()
            .units
            .iter()
            .find(|u| u.detail.id == id)
            .map(|u| u.detail.clone())
    }
}

#[async_trait]
impl Provisioner for SimCloud {
    async fn list_units(&self, _pool: &str, desired: DesiredStatus) -> Result<Vec<UnitRef>, ProvisionError> {
        let state = self.state.lock();
        Ok(state
            .units
            .iter()
            .filter(|u| match desired {
                DesiredStatus::Running => u.detail.status != UnitStatus::Stopped,
                DesiredStatus::Stopped => u.detail.status == UnitStatus::Stopped,
            })
            .map(|u| u.detail.id.clone())
            .collect())
    }

    async fn describe_units(&self, _pool: &str, units: &[UnitRef]) -> Result<Vec<UnitDetail>, ProvisionError> {
        let mut state = self.state.lock();
        let mut details = Vec::new();
        for unit in state.units.iter_mut().filter(|u| units.contains(&u.detail.id)) {
            unit.describes += 1;
            if unit.detail.status == UnitStatus::Pending && unit.describes > 1 {
                match unit.fate {
                    UnitFate::Runs => {
                        unit.detail.status = UnitStatus::Running;
                        unit.detail.health = HealthStatus::Healthy;
                    }
                    UnitFate::StaysPending => {}
                    UnitFate::Stops => unit.detail.status = UnitStatus::Stopped,
                }
            }
            let mut detail = unit.detail.clone();
            if detail.status != UnitStatus::Running {
                detail.address = None;
                detail.public_address = None;
            }
            details.push(detail);
        }
        Ok(details)
    }

    async fn create_unit(
        &self,
        _pool: &str,
        template: &str,
        overrides: &UnitOverrides,
    ) -> Result<UnitRef, ProvisionError> {
        let hang = {
            let mut state = self.state.lock();
            state.create_calls += 1;
            state.hang_creates
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();

        if let Some(reason) = state.capacity_failures.pop_front() {
            return Err(ProvisionError::from_reason(reason));
        }

        let host = state
            .hosts
            .iter()
            .find(|h| h.is_available())
            .map(|h| h.id.clone())
            .ok_or_else(|| ProvisionError::from_reason("RESOURCE:NO_HOSTS"))?;

        let role = overrides
            .metadata
            .get(ROLE_KEY)
            .and_then(|r| r.parse::<Role>().ok())
            .ok_or_else(|| ProvisionError::Rejected(format!("template {} needs a role", template)))?;
        let (address, public_address) = match role {
            Role::Backend => {
                state.backends_created += 1;
                (format!("10.0.1.{}", 4 + state.backends_created), None)
            }
            Role::Frontend => {
                state.frontends_created += 1;
                (
                    format!("10.0.2.{}", 6 + state.frontends_created),
                    Some(format!("54.0.0.{}", state.frontends_created)),
                )
            }
        };

        let mut metadata = overrides.metadata.clone();
        for (key, value) in &overrides.env {
            metadata.insert(format!("env.{}", key), value.clone());
        }

        let id = format!("{}-{}", role, state.create_calls);
        let fate = state.fates.get(&role).copied().unwrap_or_default();
        state.units.push(SimUnit {
            detail: UnitDetail {
                id: id.clone(),
                status: UnitStatus::Pending,
                health: HealthStatus::Unknown,
                address: Some(address),
                public_address,
                host: Some(host),
                metadata,
            },
            describes: 0,
            fate,
        });
        Ok(id)
    }

    async fn list_hosts(&self, _pool: &str) -> Result<Vec<HostRef>, ProvisionError> {
        Ok(self.state.lock().hosts.iter().map(|h| h.id.clone()).collect())
    }

    async fn describe_hosts(&self, _pool: &str, hosts: &[HostRef]) -> Result<Vec<HostDetail>, ProvisionError> {
        Ok(self
            .state
            .lock()
            .hosts
            .iter()
            .filter(|h| hosts.contains(&h.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FleetApi for SimCloud {
    async fn describe_fleet(&self, _fleet_id: &str) -> Result<FleetDescription, ProvisionError> {
        let state = self.state.lock();
        Ok(FleetDescription {
            desired: state.desired,
            max: state.max,
            instances: state
                .hosts
                .iter()
                .filter_map(|h| h.instance_id.clone())
                .map(|id| FleetInstance {
                    protected: state.protected.contains(&id),
                    id,
                    lifecycle_state: "InService".to_string(),
                })
                .collect(),
        })
    }

    async fn set_desired_capacity(&self, _fleet_id: &str, desired: u32) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        state.set_desired_calls += 1;
        state.desired = desired.min(state.max);
        if state.hosts_frozen {
            return Ok(());
        }

        while (state.hosts.len() as u32) < state.desired {
            state.add_host();
        }
        while (state.hosts.len() as u32) > state.desired {
            let removable = state.hosts.iter().rposition(|h| {
                let protected = h.instance_id.as_ref().is_some_and(|i| state.protected.contains(i));
                !protected && state.units_on(&h.id) == 0
            });
            match removable {
                Some(index) => {
                    state.hosts.remove(index);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn set_instance_protection(
        &self,
        _fleet_id: &str,
        instance_ids: &[String],
        protected: bool,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        state.protection_calls += 1;
        for id in instance_ids {
            if protected {
                state.protected.insert(id.clone());
            } else {
                state.protected.remove(id);
            }
        }
        Ok(())
    }
}

/// Answers probes from a script, recording when each probe happened.
///
/// Once the script runs out every probe succeeds, and the optional shutdown
/// sender is fired so a monitor under test stops.
pub struct ScriptedProber {
    clock: Arc<ManualClock>,
    script: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    on_exhausted: Option<watch::Sender<bool>>,
}

impl ScriptedProber {
    pub fn new(clock: Arc<ManualClock>, script: Vec<bool>, on_exhausted: Option<watch::Sender<bool>>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            on_exhausted,
        })
    }

    pub fn always_up(clock: Arc<ManualClock>) -> Arc<Self> {
        Self::new(clock, Vec::new(), None)
    }

    pub fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> bool {
        self.calls.lock().push((url.to_string(), self.clock.now()));
        match self.script.lock().pop_front() {
            Some(up) => up,
            None => {
                if let Some(tx) = &self.on_exhausted {
                    let _ = tx.send(true);
                }
                true
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingTerminator {
    calls: AtomicUsize,
}

impl RecordingTerminator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
