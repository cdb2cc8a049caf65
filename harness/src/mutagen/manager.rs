//! Timeout-guarded lifecycle of external sync sessions

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{Event, Payload, component_info, component_warn, event_types, payload};

use super::MutagenError;
use crate::services::event_bus::EventBus;
use crate::services::registry::ResourceRegistry;
use crate::services::timeout::TimeoutManager;
use crate::traits::{CommandResult, CommandRunner, DiagnosticsSink, RunnerError, SessionTerminator};

const COMPONENT: &str = "mutagen";
const DIAGNOSTICS_CATEGORY: &str = "mutagen-session";
const DEFAULT_TERMINATE_BUDGET: Duration = Duration::from_secs(5);
const MIN_TERMINATE_BUDGET: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Error,
    Timeout,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Error => "error",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutagenSession {
    pub session_id: String,
    pub instance_id: String,
    pub metadata: Payload,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`MutagenSessionManager::terminate_all`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminationSummary {
    pub terminated: Vec<String>,
    pub failures: BTreeMap<String, String>,
}

struct ManagerInner {
    event_bus: Arc<EventBus>,
    registry: Arc<ResourceRegistry>,
    timeouts: Arc<TimeoutManager>,
    runner: Arc<dyn CommandRunner>,
    terminator: Option<Arc<dyn SessionTerminator>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    sessions: Mutex<BTreeMap<String, MutagenSession>>,
}

/// Creates and tears down sync sessions, publishing `mutagen-status` events.
///
/// Cloning yields another handle to the same set of tracked sessions.
#[derive(Clone)]
pub struct MutagenSessionManager {
    inner: Arc<ManagerInner>,
}

impl MutagenSessionManager {
    pub fn builder(
        event_bus: Arc<EventBus>,
        registry: Arc<ResourceRegistry>,
        timeouts: Arc<TimeoutManager>,
        runner: Arc<dyn CommandRunner>,
    ) -> MutagenSessionManagerBuilder {
        MutagenSessionManagerBuilder {
            event_bus,
            registry,
            timeouts,
            runner,
            terminator: None,
            diagnostics: None,
        }
    }

    /// Run the session-create command under a `timeout` sub-budget and track
    /// the session on success.
    pub async fn create_session(
        &self,
        session_id: &str,
        instance_id: &str,
        arguments: &[String],
        timeout: Duration,
        metadata: Payload,
    ) -> Result<MutagenSession, MutagenError> {
        let budget_name = format!("mutagen-create-{session_id}");

        let result = match self.run_with_budget(&budget_name, arguments, timeout).await {
            Ok(result) => result,
            Err(RunnerError::TimedOut(after)) => {
                let message = if after.is_zero() {
                    "timeout budget exhausted before session create".to_string()
                } else {
                    format!("session create timed out after {after:?}")
                };
                component_warn!(COMPONENT, session_id, error = %message, "Sync session timed out");
                self.publish_status(
                    session_id,
                    instance_id,
                    SessionStatus::Timeout,
                    payload([("error", json!(message.clone()))]),
                );
                return Err(MutagenError::Timeout {
                    session_id: session_id.to_string(),
                    message,
                });
            }
            Err(e @ RunnerError::Launch(_)) => {
                self.publish_status(
                    session_id,
                    instance_id,
                    SessionStatus::Error,
                    payload([("error", json!(e.to_string()))]),
                );
                return Err(MutagenError::Runner {
                    session_id: session_id.to_string(),
                    source: e,
                });
            }
        };

        if !result.success() {
            self.publish_status(
                session_id,
                instance_id,
                SessionStatus::Error,
                payload([("stderr", json!(result.stderr.clone()))]),
            );
            return Err(MutagenError::Session {
                session_id: session_id.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let session = MutagenSession {
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
            metadata: metadata.clone(),
            status: SessionStatus::Created,
            created_at: Utc::now(),
        };
        self.inner
            .sessions
            .lock()
            .insert(session_id.to_string(), session.clone());

        let manager = self.clone();
        self.inner.registry.register_labeled(
            "mutagen-session",
            session_id,
            session_id.to_string(),
            move |session_id: String| async move {
                manager.terminate_session(&session_id).await?;
                Ok(())
            },
        );

        self.publish_status(
            session_id,
            instance_id,
            SessionStatus::Created,
            payload([("metadata", json!(metadata))]),
        );
        component_info!(COMPONENT, session_id, instance_id, "Sync session created");

        Ok(session)
    }

    /// Terminate one tracked session.
    ///
    /// Returns `Ok(false)` when the session is not tracked, which makes the
    /// registry-driven disposer a no-op after an explicit termination. A
    /// session whose terminator fails or is cancelled stays tracked.
    pub async fn terminate_session(&self, session_id: &str) -> Result<bool, MutagenError> {
        let Some(session) = self.inner.sessions.lock().remove(session_id) else {
            return Ok(false);
        };
        let instance_id = session.instance_id.clone();
        let pending = PendingTermination {
            sessions: &self.inner.sessions,
            session: Some(session),
        };

        if let Some(terminator) = &self.inner.terminator {
            if let Err(e) = terminator.terminate(session_id).await {
                let message = format!("{e:#}");
                component_warn!(COMPONENT, session_id, error = %message, "Session termination failed");
                self.publish_status(
                    session_id,
                    &instance_id,
                    SessionStatus::Error,
                    payload([("error", json!(message.clone()))]),
                );
                return Err(MutagenError::Terminate {
                    session_id: session_id.to_string(),
                    message,
                });
            }
        }

        pending.complete();
        self.publish_status(session_id, &instance_id, SessionStatus::Terminated, Payload::new());
        Ok(true)
    }

    /// Terminate every tracked session, sharing `timeout` between them.
    ///
    /// Each session gets `timeout / n` (at least 100ms), or 5s when no
    /// timeout is given. One failure never blocks the rest.
    pub async fn terminate_all(&self, timeout: Option<Duration>) -> TerminationSummary {
        let session_ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        let mut summary = TerminationSummary::default();
        if session_ids.is_empty() {
            return summary;
        }

        let per_session = match timeout {
            Some(total) if !total.is_zero() => (total / session_ids.len() as u32).max(MIN_TERMINATE_BUDGET),
            _ => DEFAULT_TERMINATE_BUDGET,
        };

        for session_id in session_ids {
            let name = format!("mutagen-terminate-{session_id}");
            let outcome = self
                .inner
                .timeouts
                .run(&name, per_session, self.terminate_session(&session_id))
                .await;

            match outcome {
                Ok(Ok(_)) => summary.terminated.push(session_id),
                Ok(Err(e)) => {
                    summary.failures.insert(session_id, e.to_string());
                }
                Err(e) => {
                    summary.failures.insert(session_id, e.to_string());
                }
            }
        }

        summary
    }

    /// Tracked sessions that have not been terminated
    pub fn list_sessions(&self) -> Vec<MutagenSession> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    async fn run_with_budget(
        &self,
        budget_name: &str,
        arguments: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, RunnerError> {
        let guard = self
            .inner
            .timeouts
            .sub_budget(budget_name, timeout)
            .map_err(|_| RunnerError::TimedOut(Duration::ZERO))?;
        let granted = guard.granted();

        // The runner is trusted to honour `granted`; the guard enforces it regardless
        guard
            .run(self.inner.runner.run(arguments, granted))
            .await
            .map_err(|_| RunnerError::TimedOut(granted))?
    }

    fn publish_status(&self, session_id: &str, instance_id: &str, status: SessionStatus, details: Payload) {
        let mut data = payload([
            ("status", json!(status.as_str())),
            ("session_id", json!(session_id)),
            ("instance_id", json!(instance_id)),
        ]);
        data.extend(details);

        if let Some(diagnostics) = &self.inner.diagnostics {
            diagnostics.record(DIAGNOSTICS_CATEGORY, status.as_str(), data.clone());
        }
        self.inner
            .event_bus
            .publish(Event::for_instance(event_types::MUTAGEN_STATUS, session_id, data));
    }
}

/// Puts a session back under tracking unless its termination completes
struct PendingTermination<'a> {
    sessions: &'a Mutex<BTreeMap<String, MutagenSession>>,
    session: Option<MutagenSession>,
}

impl PendingTermination<'_> {
    fn complete(mut self) {
        self.session = None;
    }
}

impl Drop for PendingTermination<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.sessions.lock().insert(session.session_id.clone(), session);
        }
    }
}

/// Collects collaborators for a [`MutagenSessionManager`]
pub struct MutagenSessionManagerBuilder {
    event_bus: Arc<EventBus>,
    registry: Arc<ResourceRegistry>,
    timeouts: Arc<TimeoutManager>,
    runner: Arc<dyn CommandRunner>,
    terminator: Option<Arc<dyn SessionTerminator>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl MutagenSessionManagerBuilder {
    pub fn terminator(mut self, terminator: Arc<dyn SessionTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> MutagenSessionManager {
        MutagenSessionManager {
            inner: Arc::new(ManagerInner {
                event_bus: self.event_bus,
                registry: self.registry,
                timeouts: self.timeouts,
                runner: self.runner,
                terminator: self.terminator,
                diagnostics: self.diagnostics,
                sessions: Mutex::new(BTreeMap::new()),
            }),
        }
    }
}
