//! Size- and age-bounded response cache.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::key::{content_key, namespace_prefix};
use super::policy::dynamic_ttl;
use crate::clock::Clock;
use crate::store::Storage;
use crate::types::{new_id, CacheEntry};

/// Last representable expiry: 9999-12-31T23:59:59Z, the end of the RFC 3339 range.
fn latest_expiry() -> DateTime<Utc> {
  DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now + ttl`, clamped instead of overflowing. Huge lifetimes mean "never",
/// hugely negative ones mean "already expired".
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  let latest = latest_expiry();
  match now.checked_add_signed(ttl) {
    Some(at) => at.clamp(DateTime::<Utc>::UNIX_EPOCH, latest),
    None if ttl < Duration::zero() => DateTime::<Utc>::UNIX_EPOCH,
    None => latest,
  }
}

/// An entry plus its position in write order.
///
/// `written_at` alone can tie when writes land in the same instant, so
/// eviction orders by `(written_at, seq)`.
struct Slot {
  entry: CacheEntry,
  seq: u64,
}

#[derive(Default)]
struct Index {
  slots: HashMap<String, Slot>,
  total_bytes: u64,
  next_seq: u64,
}

impl Index {
  fn insert(&mut self, entry: CacheEntry) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.total_bytes += entry.size_bytes;
    if let Some(old) = self
      .slots
      .insert(entry.content_key.clone(), Slot { entry, seq })
    {
      self.total_bytes -= old.entry.size_bytes;
    }
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let slot = self.slots.remove(key)?;
    self.total_bytes -= slot.entry.size_bytes;
    Some(slot.entry)
  }

  /// Key of the entry written longest ago.
  fn oldest_key(&self) -> Option<String> {
    self
      .slots
      .iter()
      .min_by_key(|(_, slot)| (slot.entry.written_at, slot.seq))
      .map(|(key, _)| key.clone())
  }
}

/// Content-addressed cache of operation results.
///
/// Recency is write time only: reading an entry never protects it from
/// eviction. Entries are persisted individually so the cache survives restarts.
pub struct ResponseCache {
  index: Mutex<Index>,
  storage: Arc<dyn Storage>,
  clock: Arc<dyn Clock>,
  max_size_bytes: u64,
}

impl ResponseCache {
  /// Create an empty cache.
  pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, max_size_bytes: u64) -> Self {
    Self {
      index: Mutex::new(Index::default()),
      storage,
      clock,
      max_size_bytes,
    }
  }

  /// Create a cache populated from persisted entries.
  ///
  /// Entries that already expired are deleted instead of loaded. If the
  /// persisted total exceeds `max_size_bytes` the oldest entries are evicted.
  pub fn load(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, max_size_bytes: u64) -> Self {
    let cache = Self::new(storage, clock, max_size_bytes);

    let mut entries = match cache.storage.load_all_cache_entries() {
      Ok(entries) => entries,
      Err(e) => {
        warn!(error = %e, "could not load cached responses, starting empty");
        Vec::new()
      }
    };
    entries.sort_by_key(|entry| entry.written_at);

    let now = cache.clock.now();
    let mut index = cache.index();
    let mut expired = 0;
    for entry in entries {
      if entry.is_expired(now) {
        cache.delete_persisted(&entry.content_key);
        expired += 1;
      } else {
        index.insert(entry);
      }
    }
    cache.evict_until_fits(&mut index, 0);

    info!(
      entries = index.slots.len(),
      bytes = index.total_bytes,
      expired,
      "loaded response cache"
    );
    drop(index);

    cache
  }

  fn index(&self) -> MutexGuard<'_, Index> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn delete_persisted(&self, key: &str) {
    if let Err(e) = self.storage.delete_cache_entry(key) {
      warn!(key = %key, error = %e, "failed to delete persisted cache entry");
    }
  }

  /// Evict oldest entries until `incoming` more bytes fit.
  fn evict_until_fits(&self, index: &mut Index, incoming: u64) {
    while index.total_bytes + incoming > self.max_size_bytes {
      let Some(key) = index.oldest_key() else {
        break;
      };
      if let Some(entry) = index.remove(&key) {
        debug!(key = %key, bytes = entry.size_bytes, "evicting cache entry for space");
        self.delete_persisted(&key);
      }
    }
  }

  /// Store `value` as the result for `payload`, valid for `ttl`.
  ///
  /// Returns the content key. An entry larger than the whole cache is still
  /// stored once everything else has been evicted.
  pub fn put(&self, namespace: &str, payload: &Value, value: Value, ttl: Duration) -> String {
    let key = content_key(namespace, payload);
    let size_bytes = value.to_string().len() as u64;
    let now = self.clock.now();

    let entry = CacheEntry {
      id: new_id(),
      content_key: key.clone(),
      value,
      written_at: now,
      expires_at: expiry(now, ttl),
      size_bytes,
    };

    let mut index = self.index();
    if index.remove(&key).is_some() {
      debug!(key = %key, "replacing cache entry");
    }
    self.evict_until_fits(&mut index, size_bytes);
    if size_bytes > self.max_size_bytes {
      warn!(
        key = %key,
        bytes = size_bytes,
        max = self.max_size_bytes,
        "cache entry exceeds the whole cache budget"
      );
    }

    if let Err(e) = self.storage.save_cache_entry(&key, &entry) {
      warn!(key = %key, error = %e, "failed to persist cache entry");
    }
    index.insert(entry);

    key
  }

  /// Look up the full entry for `payload`, dropping it if expired.
  pub fn lookup(&self, namespace: &str, payload: &Value) -> Option<CacheEntry> {
    let key = content_key(namespace, payload);
    let now = self.clock.now();

    let mut index = self.index();
    let expired = index.slots.get(&key)?.entry.is_expired(now);
    if expired {
      index.remove(&key);
      self.delete_persisted(&key);
      debug!(key = %key, "cache entry expired");
      return None;
    }

    index.slots.get(&key).map(|slot| slot.entry.clone())
  }

  /// Get the cached value for `payload`, if present and unexpired.
  pub fn get(&self, namespace: &str, payload: &Value) -> Option<Value> {
    self.lookup(namespace, payload).map(|entry| entry.value)
  }

  /// Evict entries older than their category-weighted lifetime.
  ///
  /// Runs independently of `expires_at`: an entry can be removed here
  /// before its own expiry, never kept after it.
  pub fn invalidate_by_policy(&self) -> usize {
    let now = self.clock.now();
    let mut index = self.index();

    let stale: Vec<String> = index
      .slots
      .iter()
      .filter(|(key, slot)| now - slot.entry.written_at > dynamic_ttl(key))
      .map(|(key, _)| key.clone())
      .collect();

    for key in &stale {
      index.remove(key);
      self.delete_persisted(key);
    }

    if !stale.is_empty() {
      info!(evicted = stale.len(), "policy sweep invalidated cache entries");
    }
    stale.len()
  }

  /// Drop every entry, or only those in `namespace`. Returns how many were removed.
  pub fn clear(&self, namespace: Option<&str>) -> usize {
    let prefix = namespace.map(namespace_prefix);
    let mut index = self.index();

    let doomed: Vec<String> = index
      .slots
      .keys()
      .filter(|key| prefix.as_deref().map_or(true, |p| key.starts_with(p)))
      .cloned()
      .collect();

    for key in &doomed {
      index.remove(key);
      self.delete_persisted(key);
    }

    info!(removed = doomed.len(), namespace = ?namespace, "cleared response cache");
    doomed.len()
  }

  pub fn len(&self) -> usize {
    self.index().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn total_bytes(&self) -> u64 {
    self.index().total_bytes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::{FileStorage, MemoryStorage};
  use chrono::TimeZone;
  use serde_json::json;

  const KB: u64 = 1024;

  fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ))
  }

  fn cache_with(max: u64, clock: Arc<ManualClock>) -> (ResponseCache, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let cache = ResponseCache::new(storage.clone(), clock, max);
    (cache, storage)
  }

  /// A JSON string value whose serialized form is exactly `bytes` long.
  fn blob(bytes: u64) -> Value {
    json!("x".repeat(bytes as usize - 2))
  }

  #[test]
  fn test_get_returns_put_value() {
    let (cache, _) = cache_with(100 * KB, clock());
    let payload = json!({"prompt": "hello"});

    cache.put("completion", &payload, json!({"text": "hi"}), Duration::minutes(5));

    assert_eq!(cache.get("completion", &payload), Some(json!({"text": "hi"})));
    assert_eq!(cache.get("analysis", &payload), None);
  }

  #[test]
  fn test_expired_entry_is_a_miss_and_deleted() {
    let clock = clock();
    let (cache, storage) = cache_with(100 * KB, clock.clone());
    let payload = json!({"prompt": "hello"});

    cache.put("completion", &payload, json!("answer"), Duration::minutes(1));
    clock.advance(Duration::seconds(61));

    assert_eq!(cache.get("completion", &payload), None);
    assert!(cache.is_empty());
    assert!(storage.load_all_cache_entries().unwrap().is_empty());
  }

  #[test]
  fn test_entry_valid_until_exact_expiry() {
    let clock = clock();
    let (cache, _) = cache_with(100 * KB, clock.clone());
    let payload = json!(1);

    cache.put("completion", &payload, json!("v"), Duration::minutes(1));
    clock.advance(Duration::seconds(60));

    assert_eq!(cache.get("completion", &payload), Some(json!("v")));
  }

  #[test]
  fn test_evicts_oldest_written_first() {
    let clock = clock();
    let (cache, _) = cache_with(25 * KB, clock.clone());

    cache.put("completion", &json!("a"), blob(10 * KB), Duration::hours(1));
    clock.advance(Duration::seconds(1));
    cache.put("completion", &json!("b"), blob(10 * KB), Duration::hours(1));
    clock.advance(Duration::seconds(1));

    cache.put("completion", &json!("c"), blob(10 * KB), Duration::hours(1));

    assert_eq!(cache.get("completion", &json!("a")), None);
    assert!(cache.get("completion", &json!("b")).is_some());
    assert!(cache.get("completion", &json!("c")).is_some());
    assert_eq!(cache.total_bytes(), 20 * KB);
  }

  #[test]
  fn test_reads_do_not_refresh_recency() {
    let clock = clock();
    let (cache, _) = cache_with(20 * KB, clock.clone());

    cache.put("completion", &json!("a"), blob(10 * KB), Duration::hours(1));
    clock.advance(Duration::seconds(1));
    cache.put("completion", &json!("b"), blob(10 * KB), Duration::hours(1));
    clock.advance(Duration::seconds(1));

    // Reading A must not save it
    assert!(cache.get("completion", &json!("a")).is_some());
    cache.put("completion", &json!("c"), blob(5 * KB), Duration::hours(1));

    assert_eq!(cache.get("completion", &json!("a")), None);
    assert!(cache.get("completion", &json!("b")).is_some());
  }

  #[test]
  fn test_total_size_stays_bounded() {
    let clock = clock();
    let (cache, _) = cache_with(64 * KB, clock.clone());

    for i in 0..200u64 {
      let size = KB + (i * 977) % (12 * KB);
      cache.put("generation", &json!(i), blob(size), Duration::hours(1));
      clock.advance(Duration::milliseconds(10));
      assert!(cache.total_bytes() <= 64 * KB);
    }
  }

  #[test]
  fn test_oversized_entry_is_still_stored() {
    let (cache, _) = cache_with(4 * KB, clock());
    cache.put("completion", &json!("small"), blob(KB), Duration::hours(1));

    cache.put("completion", &json!("huge"), blob(10 * KB), Duration::hours(1));

    assert_eq!(cache.len(), 1);
    assert!(cache.get("completion", &json!("huge")).is_some());
    assert_eq!(cache.total_bytes(), 10 * KB);
  }

  #[test]
  fn test_replacing_key_does_not_double_count() {
    let (cache, _) = cache_with(100 * KB, clock());
    let payload = json!({"q": 1});

    cache.put("analysis", &payload, blob(3 * KB), Duration::hours(1));
    cache.put("analysis", &payload, blob(2 * KB), Duration::hours(1));

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_bytes(), 2 * KB);
  }

  #[test]
  fn test_policy_sweep_uses_category_weights() {
    let clock = clock();
    let (cache, _) = cache_with(100 * KB, clock.clone());
    let long = Duration::hours(24);

    cache.put("agent", &json!(1), json!("a"), long);
    cache.put("template", &json!(1), json!("t"), long);
    cache.put("stats", &json!(1), json!("s"), long);
    cache.put("completion", &json!(1), json!("c"), long);

    clock.advance(Duration::minutes(45));
    assert_eq!(cache.invalidate_by_policy(), 1);
    assert_eq!(cache.get("stats", &json!(1)), None);

    clock.advance(Duration::minutes(30));
    assert_eq!(cache.invalidate_by_policy(), 1);
    assert_eq!(cache.get("completion", &json!(1)), None);

    clock.advance(Duration::minutes(60));
    assert_eq!(cache.invalidate_by_policy(), 1);
    assert_eq!(cache.get("agent", &json!(1)), None);
    assert!(cache.get("template", &json!(1)).is_some());
  }

  #[test]
  fn test_clear_by_namespace() {
    let (cache, storage) = cache_with(100 * KB, clock());
    cache.put("agent", &json!(1), json!("a"), Duration::hours(1));
    cache.put("agent", &json!(2), json!("b"), Duration::hours(1));
    cache.put("stats", &json!(1), json!("s"), Duration::hours(1));

    assert_eq!(cache.clear(Some("agent")), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(storage.load_all_cache_entries().unwrap().len(), 1);

    assert_eq!(cache.clear(None), 1);
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
  }

  #[test]
  fn test_load_restores_entries_and_drops_expired() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());

    let cache = ResponseCache::new(storage.clone(), clock.clone(), 100 * KB);
    cache.put("completion", &json!("short"), json!(1), Duration::minutes(1));
    cache.put("completion", &json!("long"), json!(2), Duration::hours(1));
    clock.advance(Duration::minutes(2));

    let reloaded = ResponseCache::load(storage.clone(), clock, 100 * KB);

    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded.get("completion", &json!("long")), Some(json!(2)));
    assert_eq!(storage.load_all_cache_entries().unwrap().len(), 1);
  }

  #[test]
  fn test_huge_ttl_is_clamped_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());
    let cache = ResponseCache::new(storage.clone(), clock.clone(), 100 * KB);

    cache.put("template", &json!(1), json!("t"), Duration::MAX);
    cache.put("template", &json!(2), json!("u"), Duration::weeks(52 * 20_000));

    let entry = cache.lookup("template", &json!(1)).unwrap();
    assert_eq!(entry.expires_at, latest_expiry());
    assert_eq!(cache.get("template", &json!(2)), Some(json!("u")));

    let reloaded = ResponseCache::load(storage, clock, 100 * KB);
    assert_eq!(reloaded.len(), 2);
  }

  #[test]
  fn test_hugely_negative_ttl_is_already_expired() {
    let (cache, _) = cache_with(100 * KB, clock());

    cache.put("stats", &json!("past"), json!(0), Duration::MIN);

    assert_eq!(cache.get("stats", &json!("past")), None);
    assert!(cache.is_empty());
  }
}
