//! Durable storage for the request queue and response cache.
//!
//! The adapter only serializes and deserializes; ordering, expiry and
//! capacity rules live in the queue and cache themselves.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use color_eyre::Result;

use crate::types::{CacheEntry, QueuedOperation};

/// Trait for persistence backends.
///
/// Loading must tolerate corrupted individual records: a record that fails
/// to parse is discarded and the remaining records are still returned.
pub trait Storage: Send + Sync {
  /// Replace the persisted queue with `items`, in order.
  fn save_queue(&self, items: &[QueuedOperation]) -> Result<()>;

  /// Load the persisted queue in its saved order.
  fn load_queue(&self) -> Result<Vec<QueuedOperation>>;

  /// Store a single cache entry under its content key.
  fn save_cache_entry(&self, key: &str, entry: &CacheEntry) -> Result<()>;

  /// Load every persisted cache entry.
  fn load_all_cache_entries(&self) -> Result<Vec<CacheEntry>>;

  /// Remove a cache entry. Removing a missing entry is not an error.
  fn delete_cache_entry(&self, key: &str) -> Result<()>;
}
