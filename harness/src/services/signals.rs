//! Named cross-task rendezvous
//!
//! Signals are short-lived markers (e.g. `ssh-ready`) that one task publishes
//! and another task waits for. Each name holds an independent FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Timed out after {timeout:?} waiting for signal '{name}'")]
    Timeout { name: String, timeout: Duration },
}

/// A signal retrieved from the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub data: Option<Value>,
}

#[derive(Default)]
pub struct SignalRegistry {
    queues: Mutex<HashMap<String, VecDeque<Option<Value>>>>,
    notify: Notify,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, name: &str, data: Option<Value>) {
        self.queues.lock().entry(name.to_string()).or_default().push_back(data);
        self.notify.notify_waiters();
        debug!(signal = name, "Signal published");
    }

    /// Wait for the next signal published under `name`
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Result<Signal, SignalError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(signal) = self.try_take(name) {
                return Ok(signal);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take(name).ok_or_else(|| SignalError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
    }

    pub fn try_take(&self, name: &str) -> Option<Signal> {
        let data = self.queues.lock().get_mut(name)?.pop_front()?;
        Some(Signal {
            name: name.to_string(),
            data,
        })
    }

    pub fn pending(&self, name: &str) -> usize {
        self.queues.lock().get(name).map_or(0, VecDeque::len)
    }

    /// Discard every queued signal
    pub fn drain(&self) {
        self.queues.lock().clear();
    }
}
