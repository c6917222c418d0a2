//! Retry with exponential backoff and jitter.
//!
//! Attempt 0 runs immediately. Before attempt `i` the orchestrator waits
//! `base * 2^(i-1)` plus up to 25% jitter, then re-probes connectivity and
//! gives up at once if the service is unreachable. Permanent errors are
//! never retried.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::OperationError;

/// Share of the exponential delay added as random jitter, exclusive.
const JITTER_FACTOR: f64 = 0.25;

/// Doubling stops here so the delay can't overflow.
const MAX_EXPONENT: u32 = 20;

const UNNAMED: &str = "unnamed";

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  pub base_delay: Duration,
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(1000))
  }
}

/// Delay before retry `attempt` (1-based), jitter included.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
  backoff_delay_with(&mut rand::thread_rng(), base, attempt)
}

/// [`backoff_delay`] with a caller-supplied RNG.
pub fn backoff_delay_with<R: Rng + ?Sized>(rng: &mut R, base: Duration, attempt: u32) -> Duration {
  let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
  let exponential = base.saturating_mul(1u32 << exponent);
  // gen::<f64>() is in [0, 1), keeping the jitter strictly below the cap
  let jitter = exponential.mul_f64(rng.gen::<f64>() * JITTER_FACTOR);
  exponential.saturating_add(jitter)
}

/// Per-name retry counters. Best effort, for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStat {
  /// Completed `execute` calls
  pub runs: u64,
  /// Individual attempts across all runs
  pub attempts: u64,
  pub successes: u64,
  pub failures: u64,
  pub last_outcome_at: Option<DateTime<Utc>>,
}

/// Runs operations with retries, consulting connectivity between attempts.
pub struct RetryOrchestrator {
  monitor: Arc<ConnectivityMonitor>,
  clock: Arc<dyn Clock>,
  stats: Mutex<HashMap<String, RetryStat>>,
}

impl RetryOrchestrator {
  pub fn new(monitor: Arc<ConnectivityMonitor>, clock: Arc<dyn Clock>) -> Self {
    Self {
      monitor,
      clock,
      stats: Mutex::new(HashMap::new()),
    }
  }

  /// Run `operation` until it succeeds, fails permanently, runs out of
  /// retries, or the service goes offline. Returns the final error on failure.
  pub async fn execute<T, F, Fut>(
    &self,
    mut operation: F,
    policy: RetryPolicy,
    name: Option<&str>,
  ) -> Result<T, OperationError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
  {
    let name = name.unwrap_or(UNNAMED);
    let mut attempt: u32 = 0;

    loop {
      let error = match operation().await {
        Ok(value) => {
          if attempt > 0 {
            debug!(name, attempts = attempt + 1, "operation succeeded after retry");
          }
          self.record(name, attempt + 1, true);
          return Ok(value);
        }
        Err(e) => e,
      };

      if error.is_permanent() {
        debug!(name, error = %error, "permanent failure, not retrying");
        self.record(name, attempt + 1, false);
        return Err(error);
      }

      if attempt >= policy.max_retries {
        warn!(name, attempts = attempt + 1, error = %error, "retries exhausted");
        self.record(name, attempt + 1, false);
        return Err(error);
      }

      attempt += 1;
      let delay = backoff_delay(policy.base_delay, attempt);
      debug!(
        name,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "retrying after transient failure"
      );
      tokio::time::sleep(delay).await;

      if !self.monitor.check().await {
        debug!(name, "service went offline, abandoning retries");
        self.record(name, attempt, false);
        return Err(OperationError::Offline);
      }
    }
  }

  fn record(&self, name: &str, attempts: u32, success: bool) {
    let now = self.clock.now();
    let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
    let stat = stats.entry(name.to_string()).or_default();

    stat.runs += 1;
    stat.attempts += u64::from(attempts);
    if success {
      stat.successes += 1;
    } else {
      stat.failures += 1;
    }
    stat.last_outcome_at = Some(now);
  }

  /// Snapshot of counters keyed by operation name.
  pub fn stats(&self) -> HashMap<String, RetryStat> {
    self
      .stats
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}
