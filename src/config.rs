use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::queue::QueueSettings;
use crate::retry::RetryPolicy;
use crate::types::{OperationKind, Priority};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub retry: RetryConfig,
  pub connectivity: ConnectivityConfig,
  pub executor: ExecutorConfig,
  /// Cache warm-up tasks (defaults to the built-in seed list)
  pub warmup: Option<Vec<WarmupTask>>,
  /// Write logs to daily files in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Cache directory (default: $XDG_CACHE_HOME/holdfast)
  pub dir: Option<PathBuf>,
  /// Keep queue and cache on disk across restarts
  pub persist: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      dir: None,
      persist: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_size_bytes: u64,
  /// Lifetime of cached request results
  pub ttl_minutes: i64,
  /// How often the category-weighted invalidation sweep runs
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: 100 * 1024 * 1024,
      ttl_minutes: 60,
      sweep_interval_secs: 600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_size: usize,
  pub batch_size: usize,
  pub max_attempts: u32,
  pub drain_delay_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_size: 1000,
      batch_size: 5,
      max_attempts: 3,
      drain_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  /// Reduced budget for cache warm-up
  pub warmup_max_retries: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      warmup_max_retries: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed for reachability (defaults to the executor base URL)
  pub probe_url: Option<Url>,
  pub interval_secs: u64,
  pub timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      interval_secs: 30,
      timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  pub base_url: Url,
  pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      base_url: Url::parse("http://localhost:8080/api/").expect("static URL is valid"),
      timeout_secs: 60,
    }
  }
}

/// A seeding operation run by cache warm-up.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WarmupTask {
  pub name: String,
  /// Cache namespace; also selects the sweep weighting (agent, template, stats)
  pub namespace: String,
  pub kind: OperationKind,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub payload: Value,
  #[serde(default = "default_warmup_ttl")]
  pub ttl_minutes: i64,
}

fn default_warmup_ttl() -> i64 {
  60
}

/// Minutes as a duration, saturating where chrono would panic.
fn saturating_minutes(minutes: i64) -> chrono::Duration {
  chrono::Duration::try_minutes(minutes).unwrap_or(if minutes < 0 {
    chrono::Duration::MIN
  } else {
    chrono::Duration::MAX
  })
}

impl WarmupTask {
  pub fn ttl(&self) -> chrono::Duration {
    saturating_minutes(self.ttl_minutes)
  }

  /// Commonly needed data worth fetching before anyone asks.
  pub fn defaults() -> Vec<WarmupTask> {
    vec![
      WarmupTask {
        name: "agent catalog".to_string(),
        namespace: "agent".to_string(),
        kind: OperationKind::Analysis,
        priority: Priority::High,
        payload: serde_json::json!({ "resource": "agents" }),
        ttl_minutes: 120,
      },
      WarmupTask {
        name: "templates".to_string(),
        namespace: "template".to_string(),
        kind: OperationKind::Generation,
        priority: Priority::Medium,
        payload: serde_json::json!({ "resource": "templates" }),
        ttl_minutes: 180,
      },
      WarmupTask {
        name: "usage stats".to_string(),
        namespace: "stats".to_string(),
        kind: OperationKind::Analysis,
        priority: Priority::Low,
        payload: serde_json::json!({ "resource": "stats" }),
        ttl_minutes: 30,
      },
    ]
  }
}

impl Config {
  /// Load configuration, falling back to defaults when no file exists.
  ///
  /// An explicit path must exist. Otherwise the first existing file among
  /// `./holdfast.yaml` and `$XDG_CONFIG_HOME/holdfast/config.yaml` is used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    match Self::candidate_paths().into_iter().find(|p| p.exists()) {
      Some(path) => {
        debug!(path = %path.display(), "using config file");
        Self::load_from_path(&path)
      }
      None => Ok(Self::default()),
    }
  }

  fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("holdfast.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("holdfast").join("config.yaml")));
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the executor bearer token from the environment, if set.
  ///
  /// Checks HOLDFAST_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HOLDFAST_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn probe_url(&self) -> Url {
    self
      .connectivity
      .probe_url
      .clone()
      .unwrap_or_else(|| self.executor.base_url.clone())
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.retry.max_retries,
      Duration::from_millis(self.retry.base_delay_ms),
    )
  }

  pub fn warmup_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.retry.warmup_max_retries,
      Duration::from_millis(self.retry.base_delay_ms),
    )
  }

  pub fn result_ttl(&self) -> chrono::Duration {
    saturating_minutes(self.cache.ttl_minutes)
  }

  pub fn queue_settings(&self) -> QueueSettings {
    QueueSettings {
      max_size: self.queue.max_size,
      batch_size: self.queue.batch_size.max(1),
      max_attempts: self.queue.max_attempts,
      drain_delay: Duration::from_millis(self.queue.drain_delay_ms),
      retry: self.retry_policy(),
      result_ttl: self.result_ttl(),
    }
  }

  pub fn warmup_tasks(&self) -> Vec<WarmupTask> {
    self.warmup.clone().unwrap_or_else(WarmupTask::defaults)
  }
}
