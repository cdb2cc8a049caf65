//! Leaf coordination services
//!
//! None of these depend on each other; the composite controllers in
//! `monitor` and `mutagen` are built on top of them.

pub mod diagnostics;
pub mod event_bus;
pub mod ports;
pub mod registry;
pub mod signals;
pub mod timeout;

pub use diagnostics::{DiagnosticEvent, DiagnosticsCollector};
pub use event_bus::{ChannelMetrics, EventBus, EventBusError, EventChannel, Subscription};
pub use ports::{PortError, SshPortPool};
pub use registry::{CleanupReport, RegistryError, ResourceRegistry};
pub use signals::{Signal, SignalError, SignalRegistry};
pub use timeout::{BudgetError, BudgetGuard, TimeoutManager};
