//! Per-scenario ownership of the leaf coordination services

use std::sync::Arc;

use shared::{component_info, component_warn};

use crate::config::HarnessConfig;
use crate::services::diagnostics::DiagnosticsCollector;
use crate::services::event_bus::EventBus;
use crate::services::registry::{CleanupReport, ResourceRegistry};
use crate::services::signals::SignalRegistry;
use crate::services::timeout::TimeoutManager;
use crate::traits::DiagnosticsSink;

/// Owns the bus, registry, budgets and signals for one scenario.
///
/// Composite components receive clones of these `Arc`s and never construct
/// their own.
pub struct ScenarioScope {
    pub event_bus: Arc<EventBus>,
    pub registry: Arc<ResourceRegistry>,
    pub timeouts: Arc<TimeoutManager>,
    pub signals: Arc<SignalRegistry>,
    pub diagnostics: Arc<DiagnosticsCollector>,
}

/// What teardown found and did
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub cleanup: CleanupReport,
    /// Number of events nobody waited for
    pub unconsumed_events: usize,
}

impl ScenarioScope {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            event_bus: Arc::new(EventBus::new()),
            registry: Arc::new(ResourceRegistry::new()),
            timeouts: Arc::new(TimeoutManager::new(config.scenario_budget)),
            signals: Arc::new(SignalRegistry::new()),
            diagnostics: Arc::new(DiagnosticsCollector::new(false, config.diagnostics_path.clone())),
        }
    }

    /// Unwind every registered resource and drain all queues
    pub async fn teardown(&self) -> TeardownReport {
        self.timeouts.checkpoint("teardown");
        let cleanup = self.registry.cleanup_all().await;
        self.signals.drain();

        let unconsumed = self.event_bus.drain_all();
        let unconsumed_events = unconsumed.values().map(Vec::len).sum();
        let by_type: Vec<String> = unconsumed
            .iter()
            .map(|(event_type, events)| format!("{event_type}={}", events.len()))
            .collect();

        self.diagnostics.record(
            "scenario",
            "teardown",
            shared::payload([
                ("disposed", serde_json::json!(cleanup.disposed.len())),
                ("failures", serde_json::json!(cleanup.failures.len())),
                ("unconsumed", serde_json::json!(by_type)),
            ]),
        );
        if let Err(e) = self.diagnostics.flush() {
            component_warn!("scenario", error = %e, "Failed to flush diagnostics");
        }
        component_info!(
            "scenario",
            disposed = cleanup.disposed.len(),
            failures = cleanup.failures.len(),
            unconsumed_events,
            "Scenario torn down"
        );

        TeardownReport {
            cleanup,
            unconsumed_events,
        }
    }
}
