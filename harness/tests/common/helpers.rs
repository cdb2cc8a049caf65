//! Test helpers and builder patterns for harness tests

use std::sync::Arc;
use std::time::Duration;

use harness::services::event_bus::EventBusError;
use harness::*;
use shared::Event;

use super::fixtures::TestFixtures;

/// Leaf services for one test, mirroring a scenario scope
pub struct TestScope {
    pub bus: Arc<EventBus>,
    pub registry: Arc<ResourceRegistry>,
    pub timeouts: Arc<TimeoutManager>,
    pub diagnostics: Arc<DiagnosticsCollector>,
}

impl TestScope {
    pub fn new() -> Self {
        Self::with_budget(Duration::from_secs(600))
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            registry: Arc::new(ResourceRegistry::new()),
            timeouts: Arc::new(TimeoutManager::new(budget)),
            diagnostics: Arc::new(DiagnosticsCollector::default()),
        }
    }

    pub async fn expect(&self, event_type: &str, instance_id: Option<&str>) -> Event {
        self.bus
            .wait_for(event_type, instance_id, TestFixtures::WAIT)
            .await
            .unwrap_or_else(|e| panic!("expected {event_type}: {e}"))
    }

    pub async fn try_expect(&self, event_type: &str, instance_id: Option<&str>, timeout: Duration) -> Result<Event, EventBusError> {
        self.bus.wait_for(event_type, instance_id, timeout).await
    }
}

/// Builder for monitor controllers with permissive mock defaults
pub struct ControllerBuilder {
    batches: Vec<Vec<MonitorAction>>,
    containers: MockContainerManager,
    cloud: MockCloudClient,
    hook: Option<MockHttpReadyHook>,
    settings: MonitorSettings,
    port_range: std::ops::RangeInclusive<u16>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        let mut containers = MockContainerManager::new();
        let mut cloud = MockCloudClient::new();

        // Set up default successful behaviors to prevent panics
        containers
            .expect_create_instance_container()
            .returning(|instance_id, port| Ok(TestFixtures::container(instance_id, port)))
            .times(0..);
        containers
            .expect_remove_instance_container()
            .returning(|_| Ok(()))
            .times(0..);
        cloud
            .expect_create_tags()
            .returning(|_, _| Ok(()))
            .times(0..);

        Self {
            batches: Vec::new(),
            containers,
            cloud,
            hook: None,
            settings: TestFixtures::monitor_settings(),
            port_range: 20000..=20100,
        }
    }

    /// Queue one poll result; later polls return nothing
    pub fn with_batch(mut self, batch: Vec<MonitorAction>) -> Self {
        self.batches.push(batch);
        self
    }

    /// Replace the container manager mock
    pub fn with_containers<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&mut MockContainerManager),
    {
        let mut containers = MockContainerManager::new();
        setup(&mut containers);
        self.containers = containers;
        self
    }

    pub fn with_hook<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&mut MockHttpReadyHook),
    {
        let mut hook = MockHttpReadyHook::new();
        setup(&mut hook);
        self.hook = Some(hook);
        self
    }

    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_port_range(mut self, range: std::ops::RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn build(self, scope: &TestScope) -> MonitorController {
        let mut batches = self.batches.into_iter();
        let mut actions = MockActionProvider::new();
        actions
            .expect_poll()
            .returning(move || Ok(batches.next().unwrap_or_default()));

        let mut builder = MonitorController::builder(scope.bus.clone(), scope.registry.clone(), scope.timeouts.clone())
            .action_provider(Arc::new(actions))
            .container_manager(Arc::new(self.containers))
            .cloud_client(Arc::new(self.cloud))
            .diagnostics(scope.diagnostics.clone())
            .port_pool(Arc::new(SshPortPool::with_probe(self.port_range, Arc::new(|_| true))))
            .settings(self.settings);
        if let Some(hook) = self.hook {
            builder = builder.http_ready_hook(Arc::new(hook));
        }
        builder.build().expect("all collaborators supplied")
    }
}

/// Test utility functions
pub struct TestHelpers;

impl TestHelpers {
    /// Consume `count` heartbeats and return their iteration numbers
    pub async fn heartbeats(scope: &TestScope, count: usize) -> Vec<u64> {
        let mut iterations = Vec::with_capacity(count);
        for _ in 0..count {
            let event = scope.expect(shared::event_types::MONITOR_HEARTBEAT, None).await;
            iterations.push(event.get("iteration").and_then(|v| v.as_u64()).unwrap_or_default());
        }
        iterations
    }

    /// Discard every pending event of one type
    pub fn discard(scope: &TestScope, event_type: &str) -> usize {
        let mut discarded = 0;
        while scope.bus.try_take(event_type, None).is_some() {
            discarded += 1;
        }
        discarded
    }
}
