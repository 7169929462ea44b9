//! Queue of names awaiting asynchronous enrichment.
//!
//! When the synchronous lookup budget runs out mid-batch, the resolver offers
//! the remaining names here. A later backfill run drains the queue and spends
//! a fresh provider budget on them; results reach the mapping tables through
//! the provider's write-through cache, so the next batch resolves them from
//! the cache.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::provider::EnterpriseInfoProvider;

/// A name waiting for enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedLookup {
    /// Key the provider is queried with.
    pub normalized_name: String,
    /// Name as it appeared in the input.
    pub raw_name: String,
    /// When the name was accepted.
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Items handed to the provider.
    pub attempted: usize,
    /// Items the provider answered.
    pub resolved: usize,
    /// Items put back because the provider stopped being `Active`.
    pub requeued: usize,
}

/// Bounded, deduplicating queue.
#[derive(Debug)]
pub struct EnrichmentQueue {
    tx: Sender<QueuedLookup>,
    rx: Receiver<QueuedLookup>,
    queued: Mutex<HashSet<String>>,
    capacity: usize,
}

impl Default for EnrichmentQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EnrichmentQueue {
    /// Capacity used by `Default`.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Creates a queue holding at most `capacity` names (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            queued: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    fn queued(&self) -> MutexGuard<'_, HashSet<String>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers a name without blocking.
    ///
    /// Returns `Ok(false)` if the name is already queued.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::QueueFull` when the queue is at capacity.
    pub fn try_enqueue(&self, normalized_name: &str, raw_name: &str) -> Result<bool, QueueError> {
        let mut queued = self.queued();
        if queued.contains(normalized_name) {
            return Ok(false);
        }

        let item = QueuedLookup {
            normalized_name: normalized_name.to_string(),
            raw_name: raw_name.to_string(),
            enqueued_at: Utc::now(),
        };
        match self.tx.try_send(item) {
            Ok(()) => {
                queued.insert(normalized_name.to_string());
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Err(QueueError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    /// Takes up to `max` items in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<QueuedLookup> {
        let mut queued = self.queued();
        let mut out = Vec::with_capacity(max.min(self.rx.len()));
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(item) => {
                    queued.remove(&item.normalized_name);
                    out.push(item);
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Items currently queued.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    /// Maximum number of queued items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drains up to `max` items through `provider`.
    ///
    /// Once the provider leaves `Active`, the untried items are put back.
    pub fn run_backfill(&self, provider: &dyn EnterpriseInfoProvider, max: usize) -> BackfillReport {
        let mut report = BackfillReport::default();
        let mut batch = self.drain(max).into_iter();

        for item in batch.by_ref() {
            if !provider.state().is_active() {
                self.requeue(item, &mut report);
                break;
            }
            report.attempted += 1;
            if provider.lookup(&item.raw_name).is_some() {
                report.resolved += 1;
            }
        }
        for item in batch {
            self.requeue(item, &mut report);
        }

        tracing::info!(
            provider = provider.name(),
            attempted = report.attempted,
            resolved = report.resolved,
            requeued = report.requeued,
            remaining = self.depth(),
            "enrichment backfill pass finished"
        );
        report
    }

    fn requeue(&self, item: QueuedLookup, report: &mut BackfillReport) {
        match self.try_enqueue(&item.normalized_name, &item.raw_name) {
            Ok(_) => report.requeued += 1,
            Err(e) => {
                tracing::warn!(name = %item.normalized_name, error = %e, "dropping queued lookup");
            }
        }
    }
}
