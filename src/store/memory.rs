//! Process-local storage used when persistence is disabled.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::Storage;
use crate::types::{CacheEntry, QueuedOperation};

/// Storage that keeps everything in memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  queue: Mutex<Vec<QueuedOperation>>,
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Storage for MemoryStorage {
  fn save_queue(&self, items: &[QueuedOperation]) -> Result<()> {
    let mut queue = self
      .queue
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *queue = items.to_vec();
    Ok(())
  }

  fn load_queue(&self) -> Result<Vec<QueuedOperation>> {
    let queue = self
      .queue
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(queue.clone())
  }

  fn save_cache_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), entry.clone());
    Ok(())
  }

  fn load_all_cache_entries(&self) -> Result<Vec<CacheEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.values().cloned().collect())
  }

  fn delete_cache_entry(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}
