//! Monitor controller and its background poll loop

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use shared::{Event, Payload, component_debug, component_info, component_warn, event_types, payload};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::MonitorError;
use super::types::{MonitorAction, MonitorSettings, MonitorShutdownResult, MonitorState, MonitorStatistics};
use crate::services::diagnostics::DiagnosticsCollector;
use crate::services::event_bus::EventBus;
use crate::services::ports::{PortError, SshPortPool};
use crate::services::registry::ResourceRegistry;
use crate::services::timeout::TimeoutManager;
use crate::traits::{ActionProvider, CloudClient, ContainerManager, DiagnosticsSink, HttpReadyHook};

const COMPONENT: &str = "monitor";
const DEFAULT_PORT_RANGE: std::ops::RangeInclusive<u16> = 20000..=30000;

/// Invoked when the poll loop misses its shutdown deadline
pub type ForceTerminate = Arc<dyn Fn() + Send + Sync>;

/// Failure while provisioning one action
#[derive(Error, Debug)]
enum ActionError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("container provisioning failed: {0:#}")]
    Provision(anyhow::Error),

    #[error("tagging failed: {0:#}")]
    Tagging(anyhow::Error),

    #[error("http readiness hook failed: {0:#}")]
    HttpStart(anyhow::Error),
}

impl ActionError {
    fn status(&self) -> &'static str {
        match self {
            ActionError::Port(_) => "port-exhausted",
            ActionError::Provision(_) => "provision-error",
            ActionError::Tagging(_) => "tagging-error",
            ActionError::HttpStart(_) => "http-start-error",
        }
    }
}

struct MonitorInner {
    event_bus: Arc<EventBus>,
    registry: Arc<ResourceRegistry>,
    timeouts: Arc<TimeoutManager>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    ports: Arc<SshPortPool>,
    containers: Arc<dyn ContainerManager>,
    cloud: Arc<dyn CloudClient>,
    actions: Arc<dyn ActionProvider>,
    http_hook: Option<Arc<dyn HttpReadyHook>>,
    force_terminate: Option<ForceTerminate>,
    settings: MonitorSettings,
    state: watch::Sender<MonitorState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    statistics: Mutex<MonitorStatistics>,
    seen: Mutex<HashSet<String>>,
}

/// Pausable poll loop that turns instance reports into readiness events.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct MonitorController {
    inner: Arc<MonitorInner>,
}

impl MonitorController {
    pub fn builder(
        event_bus: Arc<EventBus>,
        registry: Arc<ResourceRegistry>,
        timeouts: Arc<TimeoutManager>,
    ) -> MonitorControllerBuilder {
        MonitorControllerBuilder {
            event_bus,
            registry,
            timeouts,
            diagnostics: None,
            ports: None,
            containers: None,
            cloud: None,
            actions: None,
            http_hook: None,
            force_terminate: None,
            settings: MonitorSettings::default(),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.inner.state.subscribe()
    }

    pub fn statistics(&self) -> MonitorStatistics {
        self.inner.statistics.lock().clone()
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    /// Launch the poll loop. Starting an already running controller is a no-op.
    ///
    /// The controller registers its own shutdown with the resource registry
    /// so a scenario teardown stops the loop in its LIFO position. Actions
    /// reported once that teardown has begun are skipped.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(MonitorError::AlreadyShutDown);
        }

        {
            let mut worker = self.inner.worker.lock();
            if worker.is_some() {
                return Ok(());
            }
            self.inner.state.send_replace(MonitorState::Running);
            *worker = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        }

        self.inner.registry.register_labeled(
            "monitor",
            "monitor-loop",
            self.clone(),
            |controller: MonitorController| async move {
                let timeout = controller.inner.settings.shutdown_timeout;
                let result = controller.shutdown(timeout).await;
                match result.error {
                    Some(error) if !result.success => Err(anyhow::anyhow!(error)),
                    _ => Ok(()),
                }
            },
        );

        component_info!(
            COMPONENT,
            poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "Monitor loop started"
        );
        Ok(())
    }

    pub fn pause(&self) -> Result<(), MonitorError> {
        self.transition(MonitorState::Running, MonitorState::Paused, "pause")
    }

    pub fn resume(&self) -> Result<(), MonitorError> {
        self.transition(MonitorState::Paused, MonitorState::Running, "resume")
    }

    /// Stop the loop, waiting at most `timeout` for the worker to finish.
    ///
    /// Publishes `monitor-shutdown` once per controller. A loop that misses
    /// the deadline is aborted and the force-terminate hook, if any, runs.
    pub async fn shutdown(&self, timeout: Duration) -> MonitorShutdownResult {
        let already_shut_down = self.inner.shut_down.swap(true, Ordering::SeqCst);
        self.inner.state.send_replace(MonitorState::Stopped);

        let handle = self.inner.worker.lock().take();
        let result = match handle {
            None => MonitorShutdownResult::stopped(),
            Some(mut handle) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => MonitorShutdownResult::stopped(),
                Ok(Err(join_error)) => MonitorShutdownResult::failed(format!("monitor loop failed: {join_error}")),
                Err(_) => {
                    handle.abort();
                    if let Some(force_terminate) = &self.inner.force_terminate {
                        force_terminate();
                    }
                    MonitorShutdownResult::failed(format!("monitor loop did not stop within {timeout:?}"))
                }
            },
        };

        if already_shut_down {
            return result;
        }

        let mut data = payload([("success", json!(result.success))]);
        if let Some(error) = &result.error {
            component_warn!(COMPONENT, error = %error, "Monitor shutdown incomplete");
            data.insert("error".to_string(), json!(error));
        }
        self.inner.event_bus.publish(Event::global(event_types::MONITOR_SHUTDOWN, data));
        component_info!(COMPONENT, success = result.success, "Monitor stopped");

        result
    }

    fn transition(&self, from: MonitorState, to: MonitorState, action: &'static str) -> Result<(), MonitorError> {
        let mut observed = from;
        self.inner.state.send_if_modified(|state| {
            observed = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if observed != from && observed != to {
            return Err(MonitorError::InvalidTransition { from: observed, action });
        }

        let status = match to {
            MonitorState::Paused => "paused",
            _ => "resumed",
        };
        self.inner.diagnostics.record(COMPONENT, status, Payload::new());
        component_debug!(COMPONENT, state = %to, "Monitor state changed");
        Ok(())
    }
}

impl MonitorInner {
    async fn run(self: Arc<Self>) {
        let mut state_rx = self.state.subscribe();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow_and_update() == MonitorState::Stopped {
                        break;
                    }
                    continue;
                }
            }

            let state = *state_rx.borrow_and_update();
            match state {
                MonitorState::Stopped => break,
                MonitorState::Running => self.poll_tick().await,
                MonitorState::Paused => {}
            }
            // Shutdown may have landed while the tick was in flight
            if *self.state.borrow() == MonitorState::Stopped {
                break;
            }
            self.heartbeat();
        }

        component_debug!(COMPONENT, "Monitor loop exited");
    }

    async fn poll_tick(&self) {
        let outcome = match self.timeouts.sub_budget("monitor-poll", self.settings.watchdog_budget) {
            Ok(guard) => guard.run(self.process_actions()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            component_warn!(COMPONENT, error = %e, "Monitor poll exceeded watchdog budget");
            self.diagnostics
                .record(COMPONENT, "watchdog-timeout", payload([("error", json!(e.to_string()))]));
        }
    }

    async fn process_actions(&self) {
        let actions = match self.actions.poll().await {
            Ok(actions) => actions,
            Err(e) => {
                let error = format!("{e:#}");
                component_warn!(COMPONENT, error = %error, "Action provider failed");
                self.diagnostics
                    .record(COMPONENT, "poll-error", payload([("error", json!(error.clone()))]));
                self.event_bus.publish(Event::global(
                    event_types::MONITOR_ERROR,
                    payload([("error", json!(error))]),
                ));
                return;
            }
        };

        for action in actions {
            if self.winding_down() {
                component_debug!(COMPONENT, instance_id = %action.instance_id, "Skipping action during teardown");
                continue;
            }
            if !self.settings.is_ready_state(&action.state) || self.seen.lock().contains(&action.instance_id) {
                continue;
            }

            if let Err(e) = self.provision(&action).await {
                self.statistics.lock().provisioning_failures += 1;
                let error = e.to_string();
                component_warn!(COMPONENT, instance_id = %action.instance_id, error = %error, "Provisioning failed");
                self.diagnostics.record(
                    COMPONENT,
                    e.status(),
                    payload([("instance_id", json!(action.instance_id)), ("error", json!(error.clone()))]),
                );
                self.event_bus.publish(Event::for_instance(
                    event_types::MONITOR_ERROR,
                    action.instance_id.clone(),
                    payload([("error", json!(error))]),
                ));
            }
        }
    }

    /// No new resources once shutdown or a registry cleanup has begun
    fn winding_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst) || self.registry.is_closing()
    }

    async fn provision(&self, action: &MonitorAction) -> Result<(), ActionError> {
        let instance_id = action.instance_id.as_str();

        let port = self.ports.allocate(instance_id)?;
        let ports = Arc::clone(&self.ports);
        self.registry
            .register_labeled("ssh-port", &format!("{instance_id}:{port}"), port, move |port| async move {
                ports.release(port);
                Ok(())
            });

        let container = self
            .containers
            .create_instance_container(instance_id, port)
            .await
            .map_err(ActionError::Provision)?;
        let containers = Arc::clone(&self.containers);
        self.registry
            .register_labeled("ssh-container", &container.container_id, container.clone(), move |container| async move {
                containers.remove_instance_container(container).await
            });

        // Provisioned instances are never retried, even if a later step fails
        self.seen.lock().insert(instance_id.to_string());
        self.statistics.lock().instances_detected += 1;

        let tags = BTreeMap::from([
            ("harness:managed".to_string(), "true".to_string()),
            ("harness:ssh-port".to_string(), container.port.to_string()),
        ]);
        self.cloud
            .create_tags(&[instance_id.to_string()], &tags)
            .await
            .map_err(ActionError::Tagging)?;

        let mut ready = payload([("state", json!(action.state))]);
        ready.extend(action.metadata.clone());
        self.publish(event_types::INSTANCE_READY, instance_id, ready);

        let mut ssh = action.metadata.clone();
        ssh.insert("port".to_string(), json!(container.port));
        ssh.insert("key_file".to_string(), json!(container.key_file.display().to_string()));
        self.publish(event_types::SSH_READY, instance_id, ssh.clone());

        if let Some(hook) = &self.http_hook {
            hook.on_ssh_ready(instance_id, &ssh).await.map_err(ActionError::HttpStart)?;
        }

        let mut http = payload([("container_id", Value::String(container.container_id.clone()))]);
        http.extend(ssh);
        self.publish(event_types::HTTP_READY, instance_id, http);

        Ok(())
    }

    fn publish(&self, event_type: &str, instance_id: &str, data: Payload) {
        let mut details = payload([("instance_id", json!(instance_id))]);
        details.extend(data.clone());
        self.diagnostics.record("monitor-event", event_type, details);
        self.event_bus.publish(Event::for_instance(event_type, instance_id, data));
    }

    fn heartbeat(&self) {
        let iteration = {
            let mut statistics = self.statistics.lock();
            statistics.poll_iterations += 1;
            statistics.poll_iterations
        };
        let data = payload([("iteration", json!(iteration))]);
        self.diagnostics.record(COMPONENT, "heartbeat", data.clone());
        self.event_bus.publish(Event::global(event_types::MONITOR_HEARTBEAT, data));
    }
}

/// Collects collaborators for a [`MonitorController`]
pub struct MonitorControllerBuilder {
    event_bus: Arc<EventBus>,
    registry: Arc<ResourceRegistry>,
    timeouts: Arc<TimeoutManager>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    ports: Option<Arc<SshPortPool>>,
    containers: Option<Arc<dyn ContainerManager>>,
    cloud: Option<Arc<dyn CloudClient>>,
    actions: Option<Arc<dyn ActionProvider>>,
    http_hook: Option<Arc<dyn HttpReadyHook>>,
    force_terminate: Option<ForceTerminate>,
    settings: MonitorSettings,
}

impl MonitorControllerBuilder {
    pub fn action_provider(mut self, actions: Arc<dyn ActionProvider>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn container_manager(mut self, containers: Arc<dyn ContainerManager>) -> Self {
        self.containers = Some(containers);
        self
    }

    pub fn cloud_client(mut self, cloud: Arc<dyn CloudClient>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn port_pool(mut self, ports: Arc<SshPortPool>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn http_ready_hook(mut self, hook: Arc<dyn HttpReadyHook>) -> Self {
        self.http_hook = Some(hook);
        self
    }

    pub fn force_terminate(mut self, force_terminate: ForceTerminate) -> Self {
        self.force_terminate = Some(force_terminate);
        self
    }

    pub fn settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<MonitorController, MonitorError> {
        let actions = self.actions.ok_or(MonitorError::MissingCollaborator("action provider"))?;
        let containers = self
            .containers
            .ok_or(MonitorError::MissingCollaborator("container manager"))?;
        let cloud = self.cloud.ok_or(MonitorError::MissingCollaborator("cloud client"))?;

        let (state, _) = watch::channel(MonitorState::Stopped);

        Ok(MonitorController {
            inner: Arc::new(MonitorInner {
                event_bus: self.event_bus,
                registry: self.registry,
                timeouts: self.timeouts,
                diagnostics: self
                    .diagnostics
                    .unwrap_or_else(|| Arc::new(DiagnosticsCollector::default())),
                ports: self
                    .ports
                    .unwrap_or_else(|| Arc::new(SshPortPool::new(DEFAULT_PORT_RANGE))),
                containers,
                cloud,
                actions,
                http_hook: self.http_hook,
                force_terminate: self.force_terminate,
                settings: self.settings,
                state,
                worker: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                statistics: Mutex::new(MonitorStatistics::default()),
                seen: Mutex::new(HashSet::new()),
            }),
        })
    }
}
