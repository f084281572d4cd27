//! Routing of workload state-change events
//!
//! A unit entering or leaving Running updates its name records and, for
//! backend units, asks the fleet controller for a fresh evaluation.

use crate::name::{Role, WorkloadName};
use crate::provider::{UnitDetail, UnitStatus};
use crate::registration::NameRegistrar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

/// A unit changed lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEvent {
    pub unit: String,
    pub status: UnitStatus,
    #[serde(default)]
    pub role: Option<Role>,
    /// Raw workload metadata; validated before use
    #[serde(default)]
    pub workload: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub public_address: Option<String>,
}

impl UnitEvent {
    pub fn from_unit(unit: &UnitDetail) -> Self {
        Self {
            unit: unit.id.clone(),
            status: unit.status,
            role: unit.role(),
            workload: unit.workload().map(str::to_string),
            address: unit.address.clone(),
            public_address: unit.public_address.clone(),
        }
    }
}

pub struct EventRouter {
    registrar: Arc<NameRegistrar>,
    fleet_trigger: mpsc::Sender<()>,
}

impl EventRouter {
    pub fn new(registrar: Arc<NameRegistrar>, fleet_trigger: mpsc::Sender<()>) -> Self {
        Self {
            registrar,
            fleet_trigger,
        }
    }

    pub async fn handle(&self, event: &UnitEvent) {
        if !matches!(event.status, UnitStatus::Running | UnitStatus::Stopped) {
            debug!(unit = %event.unit, status = ?event.status, "Ignoring event");
            return;
        }

        if event.role == Some(Role::Backend) {
            self.trigger_fleet_evaluation();
        }

        let (Some(role), Some(raw)) = (event.role, event.workload.as_deref()) else {
            debug!(unit = %event.unit, "Event for a unit without workload metadata");
            return;
        };
        let name = match WorkloadName::parse(raw) {
            Ok(name) => name,
            Err(e) => {
                warn!(unit = %event.unit, workload = raw, error = %e, "Event with invalid workload name");
                return;
            }
        };

        match event.status {
            UnitStatus::Running => {
                let Some(address) = event.address.as_deref() else {
                    warn!(unit = %event.unit, workload = %name, "Running unit has no address yet");
                    return;
                };
                if let Err(e) = self
                    .registrar
                    .register(role, &name, &event.unit, address, event.public_address.as_deref())
                    .await
                {
                    error!(unit = %event.unit, workload = %name, error = %e, "Failed to publish name records");
                }
            }
            UnitStatus::Stopped => {
                self.registrar.deregister(role, &name, &event.unit).await;
            }
            UnitStatus::Pending | UnitStatus::Unknown => {}
        }
    }

    /// A full channel means an evaluation is already queued
    fn trigger_fleet_evaluation(&self) {
        match self.fleet_trigger.try_send(()) {
            Ok(()) => debug!("Fleet evaluation triggered"),
            Err(TrySendError::Full(())) => debug!("Fleet evaluation already queued"),
            Err(TrySendError::Closed(())) => warn!("Fleet controller is not running"),
        }
    }

    /// Consume events until the channel closes
    pub async fn run(&self, mut events: mpsc::Receiver<UnitEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(&event).await;
        }
        debug!("Event stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RegistrationConfig;
    use crate::db::Database;

    fn router() -> (EventRouter, Arc<NameRegistrar>, mpsc::Receiver<()>) {
        let registrar = Arc::new(NameRegistrar::new(
            Arc::new(Database::open_in_memory().unwrap()),
            ManualClock::starting_now(),
            &RegistrationConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(1);
        (EventRouter::new(registrar.clone(), tx), registrar, rx)
    }

    fn event(role: Role, status: UnitStatus) -> UnitEvent {
        UnitEvent {
            unit: "u-1".to_string(),
            status,
            role: Some(role),
            workload: Some("demo".to_string()),
            address: Some("10.0.1.5".to_string()),
            public_address: None,
        }
    }

    #[tokio::test]
    async fn test_backend_events_register_and_trigger_fleet() {
        let (router, registrar, mut triggers) = router();

        router.handle(&event(Role::Backend, UnitStatus::Running)).await;
        assert!(triggers.try_recv().is_ok());
        assert_eq!(registrar.lookup("backend.demo").await.unwrap().len(), 1);

        router.handle(&event(Role::Backend, UnitStatus::Stopped)).await;
        assert!(triggers.try_recv().is_ok());
        assert!(registrar.lookup("backend.demo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frontend_events_do_not_trigger_fleet() {
        let (router, registrar, mut triggers) = router();
        router.handle(&event(Role::Frontend, UnitStatus::Running)).await;
        assert!(triggers.try_recv().is_err());
        assert_eq!(registrar.lookup("frontend.demo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_of_replaced_unit_keeps_new_records() {
        let (router, registrar, _triggers) = router();
        router.handle(&event(Role::Backend, UnitStatus::Running)).await;

        let mut replacement = event(Role::Backend, UnitStatus::Running);
        replacement.unit = "u-2".to_string();
        replacement.address = Some("10.0.1.6".to_string());
        router.handle(&replacement).await;

        router.handle(&event(Role::Backend, UnitStatus::Stopped)).await;
        let records = registrar.lookup("backend.demo").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "10.0.1.6");
    }

    #[tokio::test]
    async fn test_bursts_coalesce() {
        let (router, _registrar, mut triggers) = router();
        for _ in 0..3 {
            router.handle(&event(Role::Backend, UnitStatus::Running)).await;
        }
        assert!(triggers.try_recv().is_ok());
        assert!(triggers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_workload_is_not_registered() {
        let (router, registrar, _triggers) = router();
        let mut bad = event(Role::Backend, UnitStatus::Running);
        bad.workload = Some("demo.evil".to_string());
        router.handle(&bad).await;
        assert!(registrar.lookup("backend.").await.unwrap().is_empty());
    }

    #[test]
    fn test_event_json() {
        let event: UnitEvent =
            serde_json::from_str(r#"{"unit":"abc","status":"stopped","role":"backend","workload":"demo"}"#).unwrap();
        assert_eq!(event.status, UnitStatus::Stopped);
        assert_eq!(event.role, Some(Role::Backend));
        assert!(event.address.is_none());
    }
}
