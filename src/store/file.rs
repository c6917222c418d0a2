//! File-backed storage: one queue file plus one file per cache entry.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Storage;
use crate::types::{CacheEntry, QueuedOperation};

const QUEUE_FILE: &str = "queue.json";
const ENTRIES_DIR: &str = "entries";

/// Storage rooted at a dedicated cache directory.
///
/// ```text
/// <root>/queue.json          array of queued operations
/// <root>/entries/<key>.json  one cache entry per file
/// ```
pub struct FileStorage {
  root: PathBuf,
}

impl FileStorage {
  /// Open storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(Self::default_path()?)
  }

  /// Open storage rooted at `root`, creating directories if missing.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
    let root = root.into();

    fs::create_dir_all(root.join(ENTRIES_DIR))
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", root.display(), e))?;

    Ok(Self { root })
  }

  /// Get the default storage directory.
  pub fn default_path() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("holdfast"))
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn queue_path(&self) -> PathBuf {
    self.root.join(QUEUE_FILE)
  }

  fn entry_path(&self, key: &str) -> Result<PathBuf> {
    if key.is_empty() || key.contains(&['/', '\\'][..]) || key.contains("..") {
      return Err(eyre!("Invalid cache key: {:?}", key));
    }
    Ok(self.root.join(ENTRIES_DIR).join(format!("{}.json", key)))
  }
}

/// Write through a sibling temp file so a crash never leaves a torn record.
fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
  let data =
    serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}: {}", path.display(), e))?;

  let tmp = path.with_extension("json.tmp");
  fs::write(&tmp, data).map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
  fs::rename(&tmp, path)
    .map_err(|e| eyre!("Failed to move {} into place: {}", path.display(), e))?;

  Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
    Err(e) => Err(eyre!("Failed to remove {}: {}", path.display(), e)),
  }
}

impl Storage for FileStorage {
  fn save_queue(&self, items: &[QueuedOperation]) -> Result<()> {
    write_atomic(&self.queue_path(), items)
  }

  fn load_queue(&self) -> Result<Vec<QueuedOperation>> {
    let path = self.queue_path();

    let data = match fs::read(&path) {
      Ok(data) => data,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(eyre!("Failed to read {}: {}", path.display(), e)),
    };

    // Parse records one at a time so a single bad record doesn't lose the rest
    let records: Vec<Value> = match serde_json::from_slice(&data) {
      Ok(records) => records,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "discarding unreadable queue file");
        remove_if_exists(&path)?;
        return Ok(Vec::new());
      }
    };

    let total = records.len();
    let items: Vec<QueuedOperation> = records
      .into_iter()
      .filter_map(|record| match serde_json::from_value(record) {
        Ok(item) => Some(item),
        Err(e) => {
          warn!(error = %e, "discarding corrupted queue record");
          None
        }
      })
      .collect();

    debug!(loaded = items.len(), total, "loaded persisted queue");
    Ok(items)
  }

  fn save_cache_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    write_atomic(&self.entry_path(key)?, entry)
  }

  fn load_all_cache_entries(&self) -> Result<Vec<CacheEntry>> {
    let dir = self.root.join(ENTRIES_DIR);
    let read_dir =
      fs::read_dir(&dir).map_err(|e| eyre!("Failed to list {}: {}", dir.display(), e))?;

    let mut entries = Vec::new();
    for dirent in read_dir {
      let path = match dirent {
        Ok(dirent) => dirent.path(),
        Err(e) => {
          warn!(error = %e, "skipping unreadable cache directory entry");
          continue;
        }
      };

      // Leftover from an interrupted write
      if path.to_string_lossy().ends_with(".json.tmp") {
        remove_if_exists(&path)?;
        continue;
      }
      if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        continue;
      }

      let parsed = fs::read(&path)
        .map_err(|e| e.to_string())
        .and_then(|data| serde_json::from_slice::<CacheEntry>(&data).map_err(|e| e.to_string()));

      match parsed {
        Ok(entry) => entries.push(entry),
        Err(e) => {
          warn!(path = %path.display(), error = %e, "discarding corrupted cache entry");
          remove_if_exists(&path)?;
        }
      }
    }

    Ok(entries)
  }

  fn delete_cache_entry(&self, key: &str) -> Result<()> {
    remove_if_exists(&self.entry_path(key)?)
  }
}
