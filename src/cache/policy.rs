//! Category-weighted lifetimes used by the periodic invalidation sweep.

use chrono::Duration;

/// Lifetime of an entry with no recognized category.
fn base_ttl() -> Duration {
  Duration::hours(1)
}

/// Multiplier applied to [`base_ttl`] based on what the key holds.
///
/// Agent data changes rarely, templates almost never, stats constantly.
fn category_weight(key: &str) -> f64 {
  if key.contains("agent") {
    2.0
  } else if key.contains("template") {
    3.0
  } else if key.contains("stats") {
    0.5
  } else {
    1.0
  }
}

/// Maximum age the sweep tolerates for `key`.
pub fn dynamic_ttl(key: &str) -> Duration {
  let millis = base_ttl().num_milliseconds() as f64 * category_weight(key);
  Duration::milliseconds(millis as i64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_weights_by_category() {
    assert_eq!(dynamic_ttl("agent-00ff"), Duration::hours(2));
    assert_eq!(dynamic_ttl("template-00ff"), Duration::hours(3));
    assert_eq!(dynamic_ttl("stats-00ff"), Duration::minutes(30));
    assert_eq!(dynamic_ttl("completion-00ff"), Duration::hours(1));
  }

  #[test]
  fn test_first_matching_category_wins() {
    assert_eq!(category_weight("agent_template_stats-1"), 2.0);
  }
}
