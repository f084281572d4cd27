//! Wakegate - on-demand provisioning of frontend/backend endpoint pairs
//!
//! This library provides a launch service that:
//! - Starts a workload's backend and frontend units when the workload is requested
//! - Serializes concurrent launches of one workload with TTL-bounded leases
//! - Sizes the host fleet to the backend units it has to carry, down to zero
//! - Publishes name records for running endpoints
//! - Runs a health monitor next to each endpoint that tears the pair down once
//!   its peer is gone

pub mod clock;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod events;
pub mod fleet;
pub mod lease;
pub mod monitor;
pub mod name;
pub mod orchestrator;
pub mod poll;
pub mod provider;
pub mod registration;
pub mod server;
