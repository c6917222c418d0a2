//! Durable, priority-ordered backlog of operations deferred while offline.

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::OperationError;
use crate::executor::Executor;
use crate::retry::{RetryOrchestrator, RetryPolicy};
use crate::store::Storage;
use crate::types::{new_id, OperationKind, Priority, QueuedOperation};

/// Queue limits and drain pacing.
#[derive(Debug, Clone)]
pub struct QueueSettings {
  pub max_size: usize,
  /// Operations attempted concurrently per drain batch
  pub batch_size: usize,
  /// Failed drain attempts before an operation is dropped
  pub max_attempts: u32,
  /// Pause between consecutive batches
  pub drain_delay: Duration,
  pub retry: RetryPolicy,
  /// Lifetime of results cached after a successful drain
  pub result_ttl: chrono::Duration,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      max_size: 1000,
      batch_size: 5,
      max_attempts: 3,
      drain_delay: Duration::from_secs(1),
      retry: RetryPolicy::default(),
      result_ttl: chrono::Duration::hours(1),
    }
  }
}

/// What one or more drain batches did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  pub requeued: usize,
  pub dropped: usize,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.succeeded += other.succeeded;
    self.requeued += other.requeued;
    self.dropped += other.dropped;
  }
}

/// Operations waiting to run plus those a drain batch is attempting.
///
/// Both halves are persisted, in-flight first, so an operation only leaves
/// storage once its attempt has an outcome.
#[derive(Default)]
struct Pending {
  items: Vec<QueuedOperation>,
  in_flight: Vec<QueuedOperation>,
}

impl Pending {
  fn persisted(&self) -> Vec<QueuedOperation> {
    self
      .in_flight
      .iter()
      .chain(self.items.iter())
      .cloned()
      .collect()
  }

  fn len(&self) -> usize {
    self.items.len() + self.in_flight.len()
  }
}

/// Handle on the background drain.
struct DrainTask {
  abort: AbortHandle,
  done: Shared<BoxFuture<'static, ()>>,
}

/// Priority queue of deferred operations.
///
/// Ordering is priority-major and FIFO within a priority. Items that fail a
/// drain attempt go back to the head so they are retried first.
pub struct RequestQueue {
  pending: Mutex<Pending>,
  storage: Arc<dyn Storage>,
  clock: Arc<dyn Clock>,
  executor: Arc<dyn Executor>,
  retry: Arc<RetryOrchestrator>,
  monitor: Arc<ConnectivityMonitor>,
  cache: Arc<ResponseCache>,
  settings: QueueSettings,
  drain_task: Mutex<Option<DrainTask>>,
}

impl RequestQueue {
  /// Create the queue, restoring any operations persisted by a previous run.
  pub fn new(
    settings: QueueSettings,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn Executor>,
    retry: Arc<RetryOrchestrator>,
    monitor: Arc<ConnectivityMonitor>,
    cache: Arc<ResponseCache>,
  ) -> Self {
    let mut items = match storage.load_queue() {
      Ok(items) => items,
      Err(e) => {
        warn!(error = %e, "could not load persisted queue, starting empty");
        Vec::new()
      }
    };
    if items.len() > settings.max_size {
      items.truncate(settings.max_size);
    }
    if !items.is_empty() {
      info!(pending = items.len(), "restored queued operations");
    }

    Self {
      pending: Mutex::new(Pending {
        items,
        in_flight: Vec::new(),
      }),
      storage,
      clock,
      executor,
      retry,
      monitor,
      cache,
      settings,
      drain_task: Mutex::new(None),
    }
  }

  fn pending(&self) -> MutexGuard<'_, Pending> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn drain_task(&self) -> MutexGuard<'_, Option<DrainTask>> {
    self.drain_task.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Best effort: the in-memory queue stays authoritative if the write fails.
  fn persist(&self, pending: &Pending) {
    if let Err(e) = self.storage.save_queue(&pending.persisted()) {
      warn!(error = %e, "failed to persist queue");
    }
  }

  /// In-flight operations count against `max_size` but are never dropped here.
  fn truncate_tail(&self, pending: &mut Pending) {
    let room = self.settings.max_size.saturating_sub(pending.in_flight.len());
    if pending.items.len() > room {
      let dropped = pending.items.split_off(room);
      warn!(
        dropped = dropped.len(),
        max = self.settings.max_size,
        "queue full, dropped lowest-priority operations"
      );
    }
  }

  /// Add an operation behind everything of equal or higher priority.
  pub fn enqueue(&self, kind: OperationKind, payload: Value, priority: Priority) -> String {
    let operation = QueuedOperation {
      id: new_id(),
      kind,
      payload,
      enqueued_at: self.clock.now(),
      retry_count: 0,
      priority,
    };
    let id = operation.id.clone();

    let mut pending = self.pending();
    let index = pending
      .items
      .iter()
      .position(|item| item.priority.rank() > priority.rank())
      .unwrap_or(pending.items.len());
    pending.items.insert(index, operation);
    self.truncate_tail(&mut pending);
    self.persist(&pending);

    debug!(id = %id, %kind, ?priority, position = index, pending = pending.len(), "enqueued operation");
    id
  }

  async fn attempt(&self, operation: &QueuedOperation) -> Result<Value, OperationError> {
    let name = format!("queue:{}", operation.kind);
    self
      .retry
      .execute(
        || {
          self
            .executor
            .execute(operation.kind, operation.payload.clone())
        },
        self.settings.retry,
        Some(name.as_str()),
      )
      .await
  }

  /// Attempt up to `batch_size` operations from the head, concurrently.
  ///
  /// Does nothing while offline. The batch stays persisted until every
  /// attempt in it has finished.
  pub async fn drain_batch(&self) -> DrainReport {
    if !self.monitor.is_online() {
      return DrainReport::default();
    }

    let batch: Vec<QueuedOperation> = {
      let mut pending = self.pending();
      let n = self.settings.batch_size.min(pending.items.len());
      let batch: Vec<QueuedOperation> = pending.items.drain(..n).collect();
      pending.in_flight.extend(batch.iter().cloned());
      batch
    };
    if batch.is_empty() {
      return DrainReport::default();
    }
    debug!(size = batch.len(), "draining batch");
    let batch_ids: HashSet<String> = batch.iter().map(|op| op.id.clone()).collect();

    let outcomes = join_all(batch.into_iter().map(|operation| async move {
      let result = self.attempt(&operation).await;
      (operation, result)
    }))
    .await;

    let mut report = DrainReport::default();
    let mut requeue = Vec::new();

    for (mut operation, result) in outcomes {
      match result {
        Ok(value) => {
          self.cache.put(
            operation.kind.as_str(),
            &operation.payload,
            value,
            self.settings.result_ttl,
          );
          debug!(id = %operation.id, "queued operation completed");
          report.succeeded += 1;
        }
        // Lost connectivity mid-attempt: keep the item's budget intact
        Err(OperationError::Offline) => {
          requeue.push(operation);
          report.requeued += 1;
        }
        Err(e) if e.is_permanent() => {
          warn!(id = %operation.id, error = %e, "dropping queued operation after permanent failure");
          report.dropped += 1;
        }
        Err(e) => {
          operation.retry_count += 1;
          if operation.retry_count >= self.settings.max_attempts {
            warn!(
              id = %operation.id,
              attempts = operation.retry_count,
              error = %e,
              "dropping queued operation after repeated failures"
            );
            report.dropped += 1;
          } else {
            debug!(id = %operation.id, retry_count = operation.retry_count, "requeueing at head");
            requeue.push(operation);
            report.requeued += 1;
          }
        }
      }
    }

    let mut pending = self.pending();
    // shutdown() may have put the batch back already
    pending.in_flight.retain(|op| !batch_ids.contains(&op.id));
    pending.items.retain(|op| !batch_ids.contains(&op.id));
    pending.items.splice(0..0, requeue);
    self.truncate_tail(&mut pending);
    self.persist(&pending);

    report
  }

  fn has_waiting(&self) -> bool {
    !self.pending().items.is_empty()
  }

  /// Drain batch after batch until the queue empties or connectivity drops.
  pub async fn drain_until_idle(&self) -> DrainReport {
    let mut total = DrainReport::default();

    while self.monitor.is_online() && self.has_waiting() {
      total.merge(self.drain_batch().await);

      if !self.has_waiting() || !self.monitor.is_online() {
        break;
      }
      tokio::time::sleep(self.settings.drain_delay).await;
    }

    if total != DrainReport::default() {
      info!(
        succeeded = total.succeeded,
        requeued = total.requeued,
        dropped = total.dropped,
        remaining = self.len(),
        "drain finished"
      );
    }
    total
  }

  /// Start draining in the background unless a drain is already running.
  pub fn schedule_drain(self: &Arc<Self>) {
    let mut task = self.drain_task();
    if task.as_ref().is_some_and(|t| !t.abort.is_finished()) {
      return;
    }

    let queue = Arc::clone(self);
    let handle = tokio::spawn(async move {
      queue.drain_until_idle().await;
    });
    let abort = handle.abort_handle();
    let done = async move {
      if let Err(e) = handle.await {
        if !e.is_cancelled() {
          warn!(error = %e, "background drain failed");
        }
      }
    }
    .boxed()
    .shared();

    *task = Some(DrainTask { abort, done });
  }

  /// Wait for a background drain started by [`schedule_drain`](Self::schedule_drain).
  ///
  /// The drain stays registered while waiting, so a concurrent
  /// `schedule_drain` still sees it running.
  pub async fn wait_for_drain(&self) {
    let done = self.drain_task().as_ref().map(|t| t.done.clone());
    if let Some(done) = done {
      done.await;
    }
  }

  /// Cancel a background drain. Operations it was attempting go back to the
  /// head of the queue.
  pub fn shutdown(&self) {
    if let Some(task) = self.drain_task().take() {
      task.abort.abort();
    }

    let mut pending = self.pending();
    if !pending.in_flight.is_empty() {
      let stranded = std::mem::take(&mut pending.in_flight);
      debug!(count = stranded.len(), "returning interrupted operations to the queue");
      pending.items.splice(0..0, stranded);
      self.persist(&pending);
    }
  }

  /// Remove every waiting operation. Returns how many were removed.
  ///
  /// Operations already being attempted run to their outcome.
  pub fn clear(&self) -> usize {
    let mut pending = self.pending();
    let removed = pending.items.len();
    pending.items.clear();
    self.persist(&pending);
    info!(removed, "cleared request queue");
    removed
  }

  /// Waiting plus in-flight operations.
  pub fn len(&self) -> usize {
    self.pending().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Pending operations in drain order, in-flight first.
  pub fn snapshot(&self) -> Vec<QueuedOperation> {
    self.pending().persisted()
  }
}
