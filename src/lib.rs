//! meterly — a multi-tenant quota and rate-limit enforcement engine for
//! subscription-style SaaS backends.
//!
//! The crate is a library, not a service: [`manager::Manager`] is the
//! decision engine a request handler calls into to decide whether a
//! requested consumption is allowed, composed with a pluggable
//! [`storage::Storage`] contract this crate does not implement. Concrete
//! storage backends, HTTP/RPC middleware, billing-provider webhooks, metrics
//! sinks, and the read-side usage-report handler are out of scope — they are
//! interfaces the Manager defines and calls, not code this crate ships.
//!
//! The `test-util` feature exposes [`memory_storage::InMemoryStorage`], a
//! minimal reference `Storage` used by this crate's own test suite. It is
//! not a production backend.

pub mod cache;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod manager;
pub mod period;
pub mod rate_limit;
pub mod storage;

#[cfg(feature = "test-util")]
pub mod memory_storage;

pub use config::{ManagerConfig, TierConfig};
pub use errors::{ConfigError, ManagerError, StorageError};
pub use manager::{ConsumeOptions, Manager, RefundOptions, WarningHandler};
pub use period::{Period, PeriodKind};
pub use storage::{Entitlement, Storage, Usage};
