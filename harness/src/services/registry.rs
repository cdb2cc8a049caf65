//! Ordered cleanup of scenario resources
//!
//! Every registered disposer runs exactly once, newest first, when
//! [`ResourceRegistry::cleanup_all`] is called. Failures and panics are
//! collected into a [`CleanupReport`] instead of aborting the unwind.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Cleanup failed for {kind} '{label}': {message}")]
    DisposeFailed { kind: String, label: String, message: String },

    #[error("Disposer for {kind} '{label}' panicked")]
    DisposerPanicked { kind: String, label: String },
}

type Disposer = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct ResourceEntry {
    kind: String,
    label: String,
    dispose: Disposer,
}

/// Outcome of a [`ResourceRegistry::cleanup_all`] pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    /// `(kind, label)` of each disposed entry, in disposal order
    pub disposed: Vec<(String, String)>,
    pub failures: Vec<RegistryError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<Vec<ResourceEntry>>,
    cleanups_running: AtomicUsize,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cleanup obligation. Nothing runs until [`Self::cleanup_all`].
    pub fn register<H, F, Fut>(&self, kind: &str, handle: H, dispose: F)
    where
        H: Send + 'static,
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_labeled(kind, "", handle, dispose);
    }

    pub fn register_labeled<H, F, Fut>(&self, kind: &str, label: &str, handle: H, dispose: F)
    where
        H: Send + 'static,
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = ResourceEntry {
            kind: kind.to_string(),
            label: label.to_string(),
            dispose: Box::new(move || dispose(handle).boxed()),
        };
        self.entries.lock().push(entry);
        debug!(kind, label, "Registered resource");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether a [`Self::cleanup_all`] pass is in progress. Owners should
    /// stop acquiring new resources while this holds.
    pub fn is_closing(&self) -> bool {
        self.cleanups_running.load(Ordering::SeqCst) > 0
    }

    /// Dispose every entry in reverse registration order.
    ///
    /// Entries registered by a disposer, or by a task still running while
    /// cleanup proceeds, are disposed in a further pass before this returns.
    /// A second call on an emptied registry disposes nothing.
    pub async fn cleanup_all(&self) -> CleanupReport {
        self.cleanups_running.fetch_add(1, Ordering::SeqCst);
        let mut report = CleanupReport::default();

        loop {
            let entries = std::mem::take(&mut *self.entries.lock());
            if entries.is_empty() {
                break;
            }
            for entry in entries.into_iter().rev() {
                Self::dispose(entry, &mut report).await;
            }
        }

        self.cleanups_running.fetch_sub(1, Ordering::SeqCst);
        report
    }

    async fn dispose(entry: ResourceEntry, report: &mut CleanupReport) {
        let ResourceEntry { kind, label, dispose } = entry;

        match tokio::spawn(dispose()).await {
            Ok(Ok(())) => {
                debug!(kind = %kind, label = %label, "Cleaned up resource");
                report.disposed.push((kind, label));
            }
            Ok(Err(e)) => {
                warn!(kind = %kind, label = %label, error = %e, "Cleanup failed");
                report.failures.push(RegistryError::DisposeFailed {
                    kind,
                    label,
                    message: format!("{e:#}"),
                });
            }
            Err(join_error) => {
                warn!(kind = %kind, label = %label, error = %join_error, "Disposer did not complete");
                report.failures.push(RegistryError::DisposerPanicked { kind, label });
            }
        }
    }
}
