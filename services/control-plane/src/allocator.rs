//! Front tuple allocator.
//!
//! Hands out (ip, port) pairs from the configured address pool when an
//! endpoint is created. Tuples in use by live endpoints are seeded back at
//! startup so restarts never double-allocate.

use obsidianprotection_common::config::NodeConfig;
use obsidianprotection_common::error::{Error, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub struct FrontAllocator {
    ips: Vec<Ipv4Addr>,
    port_start: u16,
    port_end: u16,
    used: HashSet<(Ipv4Addr, u16)>,
}

impl FrontAllocator {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let mut ips = Vec::new();
        for raw in &config.front_pool_ips {
            let ip: Ipv4Addr = raw
                .parse()
                .map_err(|_| Error::validation(format!("invalid front pool address {raw}")))?;
            ips.push(ip);
        }
        if ips.is_empty() {
            return Err(Error::validation("front pool must contain at least one address"));
        }

        Ok(Self {
            ips,
            port_start: config.front_port_start,
            port_end: config.front_port_end,
            used: HashSet::new(),
        })
    }

    /// Record a tuple already occupied by an existing endpoint.
    pub fn mark_used(&mut self, ip: Ipv4Addr, port: u16) {
        self.used.insert((ip, port));
    }

    /// Allocate the lowest free tuple.
    pub fn allocate(&mut self) -> Result<(Ipv4Addr, u16)> {
        for &ip in &self.ips {
            for port in self.port_start..=self.port_end {
                if !self.used.contains(&(ip, port)) {
                    self.used.insert((ip, port));
                    return Ok((ip, port));
                }
            }
        }
        Err(Error::resource_exhausted("front address pool exhausted"))
    }

    pub fn release(&mut self, ip: Ipv4Addr, port: u16) {
        self.used.remove(&(ip, port));
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}
