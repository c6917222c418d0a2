//! Response cache for offline support.
//!
//! This module provides a content-addressed cache that:
//! - Keys results by a digest of the request payload
//! - Bounds total size, evicting in write order (reads don't refresh recency)
//! - Expires entries at their own deadline and in a category-weighted sweep
//! - Persists each entry individually through a [`Storage`](crate::store::Storage)

mod key;
mod policy;
mod response;

pub use key::{content_key, normalize_namespace};
pub use policy::dynamic_ttl;
pub use response::ResponseCache;
