//! ObsidianProtection common library.
//!
//! Shared configuration, error taxonomy, database pool, telemetry and
//! Prometheus plumbing used by the control plane and the edge node.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
