//! Offline resilience layer.
//!
//! Lets a client keep issuing operations while the backing service is
//! intermittently unreachable:
//! - [`connectivity`] tracks reachability and announces transitions
//! - [`cache`] remembers results, bounded by size and age
//! - [`queue`] holds deferred operations and drains them when back online
//! - [`retry`] retries transient failures with backoff and jitter
//! - [`coordinator`] ties them together behind one `request` call

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use coordinator::{OfflineCoordinator, RequestOutcome, WarmupReport};
pub use error::OperationError;
pub use types::{OfflineStatus, OperationKind, Priority};
