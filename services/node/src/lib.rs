//! ObsidianProtection edge node.
//!
//! Runs on edge machines: loads and attaches the XDP filter, reconciles
//! endpoint and blacklist state into the kernel maps, relays accepted flows
//! to hidden origins and serves the node control API polled by the fleet
//! manager.

pub mod ebpf;
pub mod handlers;
pub mod relay;
