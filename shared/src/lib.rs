//! Shared types for the scenario coordination workspace
//!
//! Contains the event data model every component publishes, the shared
//! error type and the tracing setup used by binaries and tests.

pub mod errors;
pub mod events;
pub mod logging;

pub use errors::*;
pub use events::{Event, Payload, event_types, payload};
