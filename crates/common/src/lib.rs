//! Shared configuration, error types, IDs, and observability primitives for FQR crates.
//!
//! Architecture role:
//! - defines transport configuration used when opening foreman channels
//! - provides common [`RelayError`] / [`Result`] contracts
//! - hosts the relay metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use ids::QueryId;
pub use metrics::MetricsRegistry;
