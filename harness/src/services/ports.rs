//! SSH port allocation
//!
//! Ports are handed out from an inclusive range with a monotonic cursor and
//! checked against a probe before use. Released ports are not reused until
//! the cursor wraps around the range.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Default upper bound on ports held by one instance
pub const DEFAULT_PER_INSTANCE_LIMIT: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("No available ports in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Instance '{instance_id}' already holds {limit} ports")]
    InstanceLimit { instance_id: String, limit: usize },
}

/// Returns true when a port can be bound
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Bind-check on the loopback interface
pub fn loopback_probe() -> PortProbe {
    Arc::new(|port| TcpListener::bind(("127.0.0.1", port)).is_ok())
}

struct PoolState {
    cursor: u16,
    allocated: HashMap<u16, String>,
}

pub struct SshPortPool {
    range: RangeInclusive<u16>,
    probe: PortProbe,
    per_instance_limit: usize,
    state: Mutex<PoolState>,
}

impl SshPortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self::with_probe(range, loopback_probe())
    }

    pub fn with_probe(range: RangeInclusive<u16>, probe: PortProbe) -> Self {
        let cursor = *range.start();
        Self {
            range,
            probe,
            per_instance_limit: DEFAULT_PER_INSTANCE_LIMIT,
            state: Mutex::new(PoolState {
                cursor,
                allocated: HashMap::new(),
            }),
        }
    }

    pub fn with_per_instance_limit(mut self, limit: usize) -> Self {
        self.per_instance_limit = limit;
        self
    }

    /// Allocate the next free port for `instance_id`
    pub fn allocate(&self, instance_id: &str) -> Result<u16, PortError> {
        let (start, end) = (*self.range.start(), *self.range.end());
        let mut state = self.state.lock();

        let held = state.allocated.values().filter(|owner| *owner == instance_id).count();
        if held >= self.per_instance_limit {
            return Err(PortError::InstanceLimit {
                instance_id: instance_id.to_string(),
                limit: self.per_instance_limit,
            });
        }

        let span = usize::from(end - start) + 1;
        for _ in 0..span {
            let candidate = state.cursor;
            state.cursor = if candidate >= end { start } else { candidate + 1 };

            if state.allocated.contains_key(&candidate) || !(self.probe)(candidate) {
                continue;
            }

            state.allocated.insert(candidate, instance_id.to_string());
            debug!(port = candidate, instance_id, "Allocated SSH port");
            return Ok(candidate);
        }

        Err(PortError::Exhausted { start, end })
    }

    /// Return a port to the pool; unknown ports are ignored
    pub fn release(&self, port: u16) -> bool {
        let released = self.state.lock().allocated.remove(&port).is_some();
        if released {
            debug!(port, "Released SSH port");
        }
        released
    }

    pub fn allocated(&self) -> HashSet<u16> {
        self.state.lock().allocated.keys().copied().collect()
    }
}
