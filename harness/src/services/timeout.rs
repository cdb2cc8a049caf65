//! Hierarchical timeout budgets
//!
//! A [`TimeoutManager`] owns the root allowance for a scenario. Nested
//! operations acquire [`BudgetGuard`]s whose effective timeout is clamped to
//! the remaining time of every ancestor. Time spent inside a guard is charged
//! back to its ancestors when the guard is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("Timeout budget exhausted before '{name}' could start (elapsed={elapsed:?})")]
    Exhausted { name: String, elapsed: Duration },

    #[error("Operation '{name}' exceeded its {granted:?} budget")]
    Exceeded { name: String, granted: Duration },
}

impl BudgetError {
    /// Name of the budget that failed
    pub fn name(&self) -> &str {
        match self {
            BudgetError::Exhausted { name, .. } | BudgetError::Exceeded { name, .. } => name,
        }
    }
}

struct BudgetNode {
    name: String,
    started: Instant,
    deadline: Instant,
    consumed: Mutex<Duration>,
    parent: Option<Arc<BudgetNode>>,
}

impl BudgetNode {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn child(self: &Arc<Self>, name: &str, max: Duration) -> Result<BudgetGuard, BudgetError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(BudgetError::Exhausted {
                name: name.to_string(),
                elapsed: self.started.elapsed(),
            });
        }

        let granted = max.min(remaining);
        let started = Instant::now();
        debug!(
            budget = name,
            parent = %self.name,
            requested_ms = max.as_millis() as u64,
            granted_ms = granted.as_millis() as u64,
            "Sub-budget allocated"
        );

        Ok(BudgetGuard {
            requested: max,
            granted,
            node: Arc::new(BudgetNode {
                name: name.to_string(),
                started,
                deadline: started + granted,
                consumed: Mutex::new(Duration::ZERO),
                parent: Some(Arc::clone(self)),
            }),
        })
    }
}

/// Root of a scenario's timeout budget tree
pub struct TimeoutManager {
    budget: Duration,
    root: Arc<BudgetNode>,
}

impl TimeoutManager {
    pub fn new(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            budget,
            root: Arc::new(BudgetNode {
                name: "scenario".to_string(),
                started,
                deadline: started + budget,
                consumed: Mutex::new(Duration::ZERO),
                parent: None,
            }),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.root.started.elapsed()
    }

    /// Time left before the root deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.root.remaining()
    }

    /// Time charged back to the root by finished sub-budgets.
    ///
    /// Nested guards are counted once. Sibling guards that ran concurrently
    /// each charge their own time, so this can exceed [`Self::elapsed`].
    pub fn consumed(&self) -> Duration {
        *self.root.consumed.lock()
    }

    pub fn checkpoint(&self, description: &str) {
        debug!(
            checkpoint = description,
            elapsed_ms = self.elapsed().as_millis() as u64,
            remaining_ms = self.remaining().as_millis() as u64,
            "Timeout checkpoint"
        );
    }

    /// Acquire a sub-budget of at most `max`.
    ///
    /// Requests beyond the remaining allowance are clamped rather than
    /// rejected; compare [`BudgetGuard::granted`] with
    /// [`BudgetGuard::requested`] to detect it.
    pub fn sub_budget(&self, name: &str, max: Duration) -> Result<BudgetGuard, BudgetError> {
        self.root.child(name, max)
    }

    /// Run `fut` inside a fresh sub-budget
    pub async fn run<F, T>(&self, name: &str, max: Duration, fut: F) -> Result<T, BudgetError>
    where
        F: Future<Output = T>,
    {
        let guard = self.sub_budget(name, max)?;
        guard.run(fut).await
    }
}

/// Scoped allowance for one nested operation
pub struct BudgetGuard {
    requested: Duration,
    granted: Duration,
    node: Arc<BudgetNode>,
}

impl BudgetGuard {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn granted(&self) -> Duration {
        self.granted
    }

    pub fn requested(&self) -> Duration {
        self.requested
    }

    pub fn was_clamped(&self) -> bool {
        self.granted < self.requested
    }

    pub fn deadline(&self) -> Instant {
        self.node.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.node.remaining()
    }

    /// Time charged back by finished nested guards
    pub fn consumed(&self) -> Duration {
        *self.node.consumed.lock()
    }

    pub fn sub_budget(&self, name: &str, max: Duration) -> Result<BudgetGuard, BudgetError> {
        self.node.child(name, max)
    }

    /// Drive `fut` to completion or fail once this guard's deadline passes
    pub async fn run<F, T>(&self, fut: F) -> Result<T, BudgetError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout_at(self.node.deadline, fut)
            .await
            .map_err(|_| BudgetError::Exceeded {
                name: self.node.name.clone(),
                granted: self.granted,
            })
    }
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        let spent = self.node.started.elapsed();
        // Time already charged upwards by nested guards is not charged again
        let charge = spent.saturating_sub(*self.node.consumed.lock());
        let mut ancestor = self.node.parent.as_deref();
        while let Some(node) = ancestor {
            *node.consumed.lock() += charge;
            ancestor = node.parent.as_deref();
        }

        debug!(
            budget = %self.node.name,
            spent_ms = spent.as_millis() as u64,
            granted_ms = self.granted.as_millis() as u64,
            "Sub-budget finished"
        );
    }
}
