//! Publishes discoverable address records for running endpoints
//!
//! Records are named `<role>.<workload>`; a frontend additionally gets
//! `<workload>.<domain>` when a public domain is configured.

use crate::clock::{self, SharedClock};
use crate::config::RegistrationConfig;
use crate::db::NameRecord;
use crate::name::{Role, WorkloadName};
use crate::provider::SharedNameRegistry;
use tracing::{debug, info, warn};

pub struct NameRegistrar {
    registry: SharedNameRegistry,
    clock: SharedClock,
    domain: Option<String>,
    ttl_secs: u32,
}

impl NameRegistrar {
    pub fn new(registry: SharedNameRegistry, clock: SharedClock, config: &RegistrationConfig) -> Self {
        Self {
            registry,
            clock,
            domain: config.domain.clone(),
            ttl_secs: config.ttl_secs.min(60),
        }
    }

    /// Every record name owned by an endpoint
    pub fn record_names(&self, role: Role, name: &WorkloadName) -> Vec<String> {
        let mut names = vec![role.endpoint_host(name.as_str())];
        if let (Role::Frontend, Some(domain)) = (role, &self.domain) {
            names.push(format!("{}.{}", name, domain));
        }
        names
    }

    /// Upsert the records of an endpoint that just started. The frontend is
    /// published at its public address when it has one.
    pub async fn register(
        &self,
        role: Role,
        name: &WorkloadName,
        unit: &str,
        address: &str,
        public_address: Option<&str>,
    ) -> anyhow::Result<Vec<NameRecord>> {
        let target = match role {
            Role::Frontend => public_address.unwrap_or(address),
            Role::Backend => address,
        };
        let updated_at_ms = clock::to_millis(self.clock.now());

        let mut records = Vec::new();
        for record_name in self.record_names(role, name) {
            let record = NameRecord {
                name: record_name,
                role: role.to_string(),
                workload: name.to_string(),
                address: target.to_string(),
                unit: unit.to_string(),
                ttl_secs: self.ttl_secs,
                updated_at_ms,
            };
            self.registry.upsert(&record).await?;
            info!(record = %record.name, address = target, ttl = self.ttl_secs, "Name record published");
            records.push(record);
        }
        Ok(records)
    }

    /// Delete the records of an endpoint that stopped. Records already gone or
    /// taken over by a newer unit are left alone, and failures are only
    /// logged. Returns how many were removed.
    pub async fn deregister(&self, role: Role, name: &WorkloadName, unit: &str) -> usize {
        let mut removed = 0;
        for record_name in self.record_names(role, name) {
            match self.registry.delete(&record_name, unit).await {
                Ok(true) => {
                    info!(record = %record_name, unit, "Name record removed");
                    removed += 1;
                }
                Ok(false) => debug!(record = %record_name, unit, "Name record gone or owned by another unit"),
                Err(e) => warn!(record = %record_name, error = %e, "Failed to remove name record"),
            }
        }
        removed
    }

    pub async fn lookup(&self, prefix: &str) -> anyhow::Result<Vec<NameRecord>> {
        self.registry.lookup(prefix).await
    }
}
