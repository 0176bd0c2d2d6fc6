//! Desired-state store: durable records of endpoints, nodes, blacklist,
//! whitelists, metric samples and the audit trail.

pub mod models;
pub mod store;

pub use store::Store;
