//! Reconciliation loop primitives.
//!
//! Helpers shared by the lifecycle workflows that converge the declarative
//! fleet spec, the metadata cache and the hypervisor's live state:
//!
//! - **Spec hashing**: deterministic revisions for optimistic concurrency.
//! - **Polling**: bounded, cancellable waits for a joint condition.
//! - **Partitions**: per-item bulk results and their summary outcome.
//!
//! # Invariants
//!
//! - Hashes are computed over canonical JSON, so key order never matters.
//! - Polling never outlives its window and stops at the first cancellation.
//! - A partition places every input item in exactly one of its two sets.

use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The wait was cancelled before the condition held.
    #[error("cancelled while waiting for {resource}")]
    Cancelled { resource: String },
}

// =============================================================================
// Spec hashing
// =============================================================================

/// A spec hash for deterministic comparison.
///
/// Used as the revision of the declarative fleet document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_bytes(canonical_json(json).as_bytes())
    }

    /// Compute a spec hash over raw bytes (e.g. a file as stored on disk).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Window and cadence for a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Total time allowed for the condition to hold.
    pub max_wait: Duration,

    /// Delay between checks.
    pub interval: Duration,
}

impl PollConfig {
    pub const fn new(max_wait: Duration, interval: Duration) -> Self {
        Self { max_wait, interval }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_POLL_WINDOW,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Returns true once the cancellation signal has been raised.
pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Sleep for `duration`, returning early with an error if cancelled.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
    resource: &str,
) -> Result<(), ReconcileError> {
    if is_cancelled(cancel) {
        return Err(ReconcileError::Cancelled {
            resource: resource.to_string(),
        });
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = wait_cancelled(cancel) => Err(ReconcileError::Cancelled {
            resource: resource.to_string(),
        }),
    }
}

/// Resolves once the signal flips to `true`; never resolves if the sender is
/// dropped without cancelling.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Poll `check` until it yields a value, the window elapses, or the wait is
/// cancelled.
///
/// The first check runs immediately, so a condition that already holds
/// succeeds in a single iteration without sleeping.
pub async fn poll_until<T, F, Fut>(
    resource: &str,
    config: PollConfig,
    cancel: &mut watch::Receiver<bool>,
    mut check: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = check().await {
            debug!(resource, attempt, "Poll condition satisfied");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed + config.interval > config.max_wait {
            return Err(ReconcileError::Timeout {
                resource: resource.to_string(),
                elapsed,
            });
        }

        sleep_or_cancel(config.interval, cancel, resource).await?;
    }
}

// =============================================================================
// Bulk partitions
// =============================================================================

/// Summary of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOutcome {
    /// Every item succeeded (or the input was empty).
    AllSucceeded,
    /// Some items succeeded and some failed.
    Mixed,
    /// Every item failed.
    AllFailed,
}

/// Per-item results of a bulk operation.
///
/// Items are moved into exactly one side, so the two sets are disjoint and
/// their union is the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(T, String)>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> Partition<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&mut self, item: T) {
        self.succeeded.push(item);
    }

    pub fn fail(&mut self, item: T, reason: impl Into<String>) {
        self.failed.push((item, reason.into()));
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outcome(&self) -> BulkOutcome {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (_, true) => BulkOutcome::AllSucceeded,
            (true, false) => BulkOutcome::AllFailed,
            (false, false) => BulkOutcome::Mixed,
        }
    }
}

/// Default poll window for quiescing a VM before deletion.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_secs(30);

/// Default delay between poll checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
