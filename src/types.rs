//! Domain types shared by the queue, cache and coordinator.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The logical operation a caller wants performed by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Completion,
  Analysis,
  Generation,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Completion => "completion",
      OperationKind::Analysis => "analysis",
      OperationKind::Generation => "generation",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "completion" => Ok(OperationKind::Completion),
      "analysis" => Ok(OperationKind::Analysis),
      "generation" => Ok(OperationKind::Generation),
      other => Err(format!("unknown operation kind: {}", other)),
    }
  }
}

/// Queue priority. Declaration order is drain order.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Medium,
  Low,
}

impl Priority {
  /// Lower rank drains first.
  pub fn rank(&self) -> u8 {
    match self {
      Priority::High => 0,
      Priority::Medium => 1,
      Priority::Low => 2,
    }
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "high" => Ok(Priority::High),
      "medium" => Ok(Priority::Medium),
      "low" => Ok(Priority::Low),
      other => Err(format!("unknown priority: {}", other)),
    }
  }
}

/// An operation deferred until the service is reachable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: String,
  pub kind: OperationKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub retry_count: u32,
  pub priority: Priority,
}

/// A stored result, addressed by a digest of the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub id: String,
  pub content_key: String,
  pub value: Value,
  pub written_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub size_bytes: u64,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// Snapshot of the offline layer for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineStatus {
  pub is_online: bool,
  pub last_online_check: Option<DateTime<Utc>>,
  pub pending_requests: usize,
  pub cached_responses: usize,
  /// Total bytes held by the response cache
  pub cache_size_bytes: u64,
}

/// Random 64-bit identifier rendered as hex.
pub fn new_id() -> String {
  format!("{:016x}", rand::thread_rng().gen::<u64>())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_priority_order_matches_rank() {
    assert!(Priority::High < Priority::Medium);
    assert!(Priority::Medium < Priority::Low);
    assert_eq!(Priority::Low.rank(), 2);
  }

  #[test]
  fn test_kind_parse_is_case_insensitive() {
    assert_eq!(
      "Completion".parse::<OperationKind>(),
      Ok(OperationKind::Completion)
    );
    assert!("summary".parse::<OperationKind>().is_err());
  }

  #[test]
  fn test_queued_operation_defaults_retry_count() {
    let json = r#"{
      "id": "abc",
      "kind": "analysis",
      "payload": {"text": "hi"},
      "enqueued_at": "2024-05-01T10:00:00Z",
      "priority": "high"
    }"#;
    let op: QueuedOperation = serde_json::from_str(json).unwrap();
    assert_eq!(op.retry_count, 0);
    assert_eq!(op.kind, OperationKind::Analysis);
    assert_eq!(op.enqueued_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
  }

  #[test]
  fn test_new_id_is_hex() {
    let id = new_id();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
