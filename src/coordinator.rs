//! Offline coordinator: the single entry point callers use.
//!
//! Wraps the executor with the response cache, retry orchestrator and
//! request queue so a request either returns a result or is safely queued
//! for when the service comes back.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, WarmupTask};
use crate::connectivity::{ConnectivityMonitor, Probe};
use crate::error::OperationError;
use crate::executor::Executor;
use crate::queue::{DrainReport, RequestQueue};
use crate::retry::{RetryOrchestrator, RetryPolicy, RetryStat};
use crate::store::Storage;
use crate::types::{OfflineStatus, OperationKind, Priority, QueuedOperation};

/// How a request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
  /// Fresh result from the service
  Fresh(Value),
  /// Served from the response cache
  Cached {
    value: Value,
    written_at: DateTime<Utc>,
  },
  /// Deferred until the service is reachable; the result will be cached
  Queued { id: String },
}

impl RequestOutcome {
  pub fn value(&self) -> Option<&Value> {
    match self {
      RequestOutcome::Fresh(value) | RequestOutcome::Cached { value, .. } => Some(value),
      RequestOutcome::Queued { .. } => None,
    }
  }
}

/// What cache warm-up did with each task, by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
  pub warmed: Vec<String>,
  /// Already cached, or skipped because the service is offline
  pub skipped: Vec<String>,
  pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
struct Settings {
  request_policy: RetryPolicy,
  warmup_policy: RetryPolicy,
  result_ttl: chrono::Duration,
  probe_interval: Duration,
  sweep_interval: Duration,
}

/// Composes connectivity, cache, retry and queue into one façade.
pub struct OfflineCoordinator {
  monitor: Arc<ConnectivityMonitor>,
  cache: Arc<ResponseCache>,
  queue: Arc<RequestQueue>,
  retry: Arc<RetryOrchestrator>,
  executor: Arc<dyn Executor>,
  settings: Settings,
  sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineCoordinator {
  /// Build every component from `config`, restoring persisted state.
  pub fn new(
    config: &Config,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    probe: Arc<dyn Probe>,
  ) -> Self {
    Self::with_clock(config, storage, executor, probe, Arc::new(SystemClock))
  }

  pub fn with_clock(
    config: &Config,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let monitor = Arc::new(ConnectivityMonitor::new(
      probe,
      clock.clone(),
      Duration::from_secs(config.connectivity.timeout_secs),
    ));
    let retry = Arc::new(RetryOrchestrator::new(monitor.clone(), clock.clone()));
    let cache = Arc::new(ResponseCache::load(
      storage.clone(),
      clock.clone(),
      config.cache.max_size_bytes,
    ));
    let queue = Arc::new(RequestQueue::new(
      config.queue_settings(),
      storage,
      clock,
      executor.clone(),
      retry.clone(),
      monitor.clone(),
      cache.clone(),
    ));

    // Coming back online drains whatever piled up
    let weak_queue = Arc::downgrade(&queue);
    monitor.on_status_change(move |online| {
      if let (true, Some(queue)) = (online, weak_queue.upgrade()) {
        if !queue.is_empty() {
          info!(pending = queue.len(), "back online, draining queue");
          queue.schedule_drain();
        }
      }
    });

    Self {
      monitor,
      cache,
      queue,
      retry,
      executor,
      settings: Settings {
        request_policy: config.retry_policy(),
        warmup_policy: config.warmup_policy(),
        result_ttl: config.result_ttl(),
        probe_interval: Duration::from_secs(config.connectivity.interval_secs.max(1)),
        sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
      },
      sweep_task: Mutex::new(None),
    }
  }

  /// Start the connectivity timer and the cache sweep, and resume any
  /// persisted backlog. Must be called inside a tokio runtime.
  pub fn start(&self) {
    self.monitor.start(self.settings.probe_interval);

    let cache = Arc::downgrade(&self.cache);
    let interval = self.settings.sweep_interval;
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
          break;
        };
        cache.invalidate_by_policy();
      }
    });
    if let Some(previous) = self
      .sweep_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle)
    {
      previous.abort();
    }

    if !self.queue.is_empty() && self.monitor.is_online() {
      self.queue.schedule_drain();
    }
  }

  /// Cancel every timer and background drain.
  pub fn shutdown(&self) {
    self.monitor.shutdown();
    self.queue.shutdown();
    if let Some(handle) = self
      .sweep_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
    debug!("offline coordinator shut down");
  }

  /// Perform `kind` on `payload` at medium priority.
  pub async fn request(
    &self,
    kind: OperationKind,
    payload: Value,
  ) -> Result<RequestOutcome, OperationError> {
    self
      .request_with_priority(kind, payload, Priority::Medium)
      .await
  }

  /// Perform `kind` on `payload`.
  ///
  /// 1. Cache hit - return it
  /// 2. Offline - queue at `priority`
  /// 3. Online - call the executor with retries and cache the result
  /// 4. Permanent failure - return the error
  /// 5. Transient failure after retries - queue at `priority`
  pub async fn request_with_priority(
    &self,
    kind: OperationKind,
    payload: Value,
    priority: Priority,
  ) -> Result<RequestOutcome, OperationError> {
    if payload.is_null() {
      return Err(OperationError::InvalidPayload(
        "payload must not be null".to_string(),
      ));
    }

    if let Some(entry) = self.cache.lookup(kind.as_str(), &payload) {
      debug!(%kind, key = %entry.content_key, "serving cached response");
      return Ok(RequestOutcome::Cached {
        value: entry.value,
        written_at: entry.written_at,
      });
    }

    if !self.monitor.is_online() {
      let id = self.queue.enqueue(kind, payload, priority);
      info!(%kind, id = %id, "offline, request queued");
      return Ok(RequestOutcome::Queued { id });
    }

    let name = format!("request:{}", kind);
    let result = self
      .retry
      .execute(
        || self.executor.execute(kind, payload.clone()),
        self.settings.request_policy,
        Some(name.as_str()),
      )
      .await;

    match result {
      Ok(value) => {
        self
          .cache
          .put(kind.as_str(), &payload, value.clone(), self.settings.result_ttl);
        Ok(RequestOutcome::Fresh(value))
      }
      Err(e) if e.is_permanent() => Err(e),
      Err(e) => {
        let id = self.queue.enqueue(kind, payload, priority);
        info!(%kind, id = %id, error = %e, "request failed, queued for later");
        Ok(RequestOutcome::Queued { id })
      }
    }
  }

  /// Pre-populate the cache, highest priority first.
  ///
  /// Failures are logged and reported, never returned as errors.
  pub async fn warm_cache(&self, tasks: &[WarmupTask]) -> WarmupReport {
    let mut report = WarmupReport::default();

    if !self.monitor.is_online() {
      info!("offline, skipping cache warm-up");
      report.skipped = tasks.iter().map(|t| t.name.clone()).collect();
      return report;
    }

    let mut ordered: Vec<&WarmupTask> = tasks.iter().collect();
    ordered.sort_by_key(|task| task.priority);

    for task in ordered {
      if self.cache.get(&task.namespace, &task.payload).is_some() {
        debug!(task = %task.name, "already cached");
        report.skipped.push(task.name.clone());
        continue;
      }

      let name = format!("warmup:{}", task.name);
      let result = self
        .retry
        .execute(
          || self.executor.execute(task.kind, task.payload.clone()),
          self.settings.warmup_policy,
          Some(name.as_str()),
        )
        .await;

      match result {
        Ok(value) => {
          self.cache.put(
            &task.namespace,
            &task.payload,
            value,
            task.ttl(),
          );
          report.warmed.push(task.name.clone());
        }
        Err(e) => {
          warn!(task = %task.name, error = %e, "cache warm-up task failed");
          report.failed.push(task.name.clone());
        }
      }
    }

    info!(
      warmed = report.warmed.len(),
      skipped = report.skipped.len(),
      failed = report.failed.len(),
      "cache warm-up finished"
    );
    report
  }

  pub fn status(&self) -> OfflineStatus {
    OfflineStatus {
      is_online: self.monitor.is_online(),
      last_online_check: self.monitor.last_checked_at(),
      pending_requests: self.queue.len(),
      cached_responses: self.cache.len(),
      cache_size_bytes: self.cache.total_bytes(),
    }
  }

  /// Register a callback for online/offline transitions.
  pub fn on_online_status_change<F>(&self, listener: F)
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.monitor.on_status_change(listener);
  }

  /// Probe connectivity now.
  pub async fn check_online(&self) -> bool {
    self.monitor.check().await
  }

  /// Drain the queue in the foreground until it empties or goes offline.
  pub async fn drain(&self) -> DrainReport {
    self.queue.drain_until_idle().await
  }

  pub fn pending(&self) -> Vec<QueuedOperation> {
    self.queue.snapshot()
  }

  /// Run the category-weighted invalidation sweep now.
  pub fn sweep_cache(&self) -> usize {
    self.cache.invalidate_by_policy()
  }

  pub fn clear_cache(&self, namespace: Option<&str>) -> usize {
    self.cache.clear(namespace)
  }

  pub fn clear_queue(&self) -> usize {
    self.queue.clear()
  }

  pub fn retry_stats(&self) -> HashMap<String, RetryStat> {
    self.retry.stats()
  }
}

impl Drop for OfflineCoordinator {
  fn drop(&mut self) {
    self.shutdown();
  }
}
