//! Scenario scaffolding: scope ownership, simulated collaborators and the
//! readiness scenario driven by the `harness` binary.

pub mod readiness;
pub mod scope;
pub mod simulated;

pub use readiness::{InstanceReadiness, ScenarioReport, run_readiness_scenario};
pub use scope::{ScenarioScope, TeardownReport};
