use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use holdfast::config::Config;
use holdfast::connectivity::HttpProbe;
use holdfast::executor::HttpExecutor;
use holdfast::store::{FileStorage, MemoryStorage, Storage};
use holdfast::{OfflineCoordinator, OperationKind, Priority, RequestOutcome};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "holdfast")]
#[command(about = "Offline resilience layer: cache, queue and retry for a flaky service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/holdfast/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level unless HOLDFAST_LOG says otherwise
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe connectivity and print queue/cache status
  Status,
  /// Perform an operation, serving from cache or queueing when offline
  Request {
    /// completion, analysis or generation
    kind: OperationKind,
    /// JSON payload
    payload: String,
    /// high, medium or low (used if the request is queued)
    #[arg(short, long, default_value = "medium")]
    priority: Priority,
  },
  /// Drain queued operations now
  Drain,
  /// Pre-populate the cache with the configured warm-up tasks
  Warm,
  /// Remove cached responses
  ClearCache {
    /// Only clear this namespace (e.g. completion, agent)
    #[arg(short, long)]
    namespace: Option<String>,
  },
  /// Remove every queued operation
  ClearQueue,
  /// Keep probing and draining until Ctrl-C
  Watch,
}

fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
  if !config.storage.persist {
    return Ok(Arc::new(MemoryStorage::new()));
  }

  let storage = match &config.storage.dir {
    Some(dir) => FileStorage::open(dir)?,
    None => FileStorage::open_default()?,
  };
  info!(dir = %storage.root().display(), "using cache directory");
  Ok(Arc::new(storage))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", text);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = holdfast::logging::init(config.log_dir.as_deref(), args.verbose)?;

  let storage = open_storage(&config)?;
  let executor = Arc::new(HttpExecutor::new(
    config.executor.base_url.clone(),
    Duration::from_secs(config.executor.timeout_secs),
    Config::get_api_token(),
  )?);
  let probe = Arc::new(HttpProbe::new(
    config.probe_url(),
    Duration::from_secs(config.connectivity.timeout_secs),
  )?);

  let coordinator = OfflineCoordinator::new(&config, storage, executor, probe);

  match args.command {
    Command::Status => {
      coordinator.check_online().await;
      print_json(&json!({
        "status": coordinator.status(),
        "pending": coordinator.pending(),
      }))?;
    }
    Command::Request {
      kind,
      payload,
      priority,
    } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      coordinator.check_online().await;

      let outcome = coordinator
        .request_with_priority(kind, payload, priority)
        .await?;
      let rendered = match outcome {
        RequestOutcome::Fresh(value) => json!({ "source": "network", "value": value }),
        RequestOutcome::Cached { value, written_at } => {
          json!({ "source": "cache", "written_at": written_at, "value": value })
        }
        RequestOutcome::Queued { id } => json!({ "source": "queued", "id": id }),
      };
      print_json(&rendered)?;
    }
    Command::Drain => {
      if !coordinator.check_online().await {
        return Err(eyre!("Service is unreachable, nothing drained"));
      }
      let report = coordinator.drain().await;
      print_json(&json!({
        "succeeded": report.succeeded,
        "requeued": report.requeued,
        "dropped": report.dropped,
        "remaining": coordinator.status().pending_requests,
        "retry_stats": coordinator.retry_stats(),
      }))?;
    }
    Command::Warm => {
      coordinator.check_online().await;
      let report = coordinator.warm_cache(&config.warmup_tasks()).await;
      print_json(&json!({
        "warmed": report.warmed,
        "skipped": report.skipped,
        "failed": report.failed,
      }))?;
    }
    Command::ClearCache { namespace } => {
      let removed = coordinator.clear_cache(namespace.as_deref());
      println!("Removed {} cached responses", removed);
    }
    Command::ClearQueue => {
      let removed = coordinator.clear_queue();
      println!("Removed {} queued operations", removed);
    }
    Command::Watch => {
      coordinator.on_online_status_change(|online| {
        info!(online, "service {}", if online { "reachable" } else { "unreachable" });
      });
      coordinator.start();
      info!("watching connectivity, press Ctrl-C to stop");

      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
      coordinator.shutdown();
      print_json(&coordinator.status())?;
    }
  }

  Ok(())
}
