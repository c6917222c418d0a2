//! Online/offline tracking driven by a periodic reachability probe.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

use crate::clock::Clock;

/// A single reachability check. No retries: one failure means unreachable.
pub trait Probe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, bool>;
}

/// Probe that issues a `HEAD` request. Any HTTP response counts as reachable.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;

    Ok(Self { client, url })
  }
}

impl Probe for HttpProbe {
  fn probe(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      match self.client.head(self.url.clone()).send().await {
        Ok(response) => {
          debug!(url = %self.url, status = %response.status(), "probe reached service");
          true
        }
        Err(e) => {
          debug!(url = %self.url, error = %e, "probe failed");
          false
        }
      }
    })
  }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct State {
  online: bool,
  last_checked_at: Option<DateTime<Utc>>,
}

/// Tracks whether the backing service is reachable.
///
/// Starts optimistic (online). Listeners fire only when the state flips.
pub struct ConnectivityMonitor {
  probe: Arc<dyn Probe>,
  clock: Arc<dyn Clock>,
  timeout: Duration,
  state: Mutex<State>,
  listeners: Mutex<Vec<Listener>>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  pub fn new(probe: Arc<dyn Probe>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
    Self {
      probe,
      clock,
      timeout,
      state: Mutex::new(State {
        online: true,
        last_checked_at: None,
      }),
      listeners: Mutex::new(Vec::new()),
      timer: Mutex::new(None),
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_online(&self) -> bool {
    self.state().online
  }

  pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
    self.state().last_checked_at
  }

  /// Register a callback for online/offline transitions.
  pub fn on_status_change<F>(&self, listener: F)
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Arc::new(listener));
  }

  /// Probe once and update the state. Returns whether the service is reachable.
  pub async fn check(&self) -> bool {
    let reachable = matches!(
      tokio::time::timeout(self.timeout, self.probe.probe()).await,
      Ok(true)
    );

    let changed = {
      let mut state = self.state();
      let changed = state.online != reachable;
      state.online = reachable;
      state.last_checked_at = Some(self.clock.now());
      changed
    };

    if changed {
      info!(online = reachable, "connectivity changed");
      // Call outside the lock so listeners may query the monitor
      let listeners = self
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
      for listener in listeners {
        listener(reachable);
      }
    }

    reachable
  }

  /// Start probing every `interval`, beginning immediately.
  ///
  /// Replaces a previously started timer.
  pub fn start(self: &Arc<Self>, interval: Duration) {
    let monitor: Weak<Self> = Arc::downgrade(self);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
          break;
        };
        monitor.check().await;
      }
    });

    let previous = self
      .timer
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Cancel the probe timer.
  pub fn shutdown(&self) {
    if let Some(handle) = self
      .timer
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::testing::StaticProbe;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn monitor(probe: Arc<StaticProbe>) -> Arc<ConnectivityMonitor> {
    Arc::new(ConnectivityMonitor::new(
      probe,
      Arc::new(SystemClock),
      Duration::from_secs(5),
    ))
  }

  #[tokio::test]
  async fn test_starts_online_and_unchecked() {
    let monitor = monitor(Arc::new(StaticProbe::new(true)));
    assert!(monitor.is_online());
    assert!(monitor.last_checked_at().is_none());
  }

  #[tokio::test]
  async fn test_listeners_fire_only_on_transition() {
    let probe = Arc::new(StaticProbe::new(true));
    let monitor = monitor(probe.clone());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    monitor.on_status_change(move |online| sink.lock().unwrap().push(online));

    assert!(monitor.check().await);
    probe.set_online(false);
    assert!(!monitor.check().await);
    assert!(!monitor.check().await);
    probe.set_online(true);
    assert!(monitor.check().await);

    assert_eq!(*events.lock().unwrap(), vec![false, true]);
    assert!(monitor.last_checked_at().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_probe_counts_as_offline() {
    let probe = Arc::new(StaticProbe::new(true));
    probe.set_hang(true);
    let monitor = monitor(probe);

    let started = tokio::time::Instant::now();
    assert!(!monitor.check().await);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(!monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_probes_periodically_until_shutdown() {
    let probe = Arc::new(StaticProbe::new(true));
    let monitor = monitor(probe.clone());
    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = transitions.clone();
    monitor.on_status_change(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    monitor.start(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(probe.calls(), 1);

    probe.set_online(false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.calls(), 2);
    assert!(!monitor.is_online());
    assert_eq!(transitions.load(Ordering::SeqCst), 1);

    monitor.shutdown();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(probe.calls(), 2);
  }
}
