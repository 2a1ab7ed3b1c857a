//! vmfleet orchestrator library.
//!
//! Ships the `vmfleetd` binary; the library surface exists so integration
//! tests can drive workflows against fake collaborators.

pub mod api;
pub mod config;
pub mod config_mgmt;
pub mod db;
pub mod fleet_spec;
pub mod hypervisor;
pub mod lifecycle;
pub mod notifications;
pub mod provision;
pub mod state;
pub mod tasks;
