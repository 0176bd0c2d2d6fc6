//! Map synchronizer: control-plane writes into the shared kernel maps.
//!
//! Owns the userspace handles of the maps published by the XDP object plus an
//! authoritative mirror of operator state (endpoints, blacklist) used for
//! listing, uniqueness checks and node resync responses. Endpoint updates are
//! a single insert-or-replace at the front key, so the fast path observes
//! either the old or the new policy and never a missing endpoint.
//!
//! Without kernel handles (`standalone`) all operations act on the mirror
//! only; this is how the unit tests and non-root development runs work.

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{HashMap as KernelHashMap, Map, MapData, PerCpuArray};
use aya::Ebpf;
use obsidianprotection_common::error::{Error, Result};
use obsidianprotection_common::types::{CounterSnapshot, EndpointSpec};
use obsidianprotection_ebpf::{
    map_names, stat, ConntrackEntry, EndpointInfo, EndpointKey, UdpChallengeState,
    CHALLENGE_WINDOW_MS, ENDPOINT_KEY_BITS,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::monotonic_ms;

struct KernelHandles {
    endpoints: Mutex<LpmTrie<MapData, EndpointKey, EndpointInfo>>,
    blacklist: Mutex<KernelHashMap<MapData, u32, u64>>,
    conntrack: Mutex<KernelHashMap<MapData, u64, ConntrackEntry>>,
    challenges: Mutex<KernelHashMap<MapData, u32, UdpChallengeState>>,
    stats: Mutex<PerCpuArray<MapData, u64>>,
}

/// Control-plane view of the shared maps.
pub struct MapSync {
    kernel: Option<KernelHandles>,
    endpoints: RwLock<HashMap<EndpointKey, EndpointSpec>>,
    blacklist: RwLock<HashMap<Ipv4Addr, u64>>,
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<Map> {
    ebpf.take_map(name)
        .ok_or_else(|| Error::internal(format!("map {name} not found in object")))
}

impl MapSync {
    /// Take ownership of the kernel map handles from a loaded object.
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self> {
        let endpoints = LpmTrie::try_from(take_map(ebpf, map_names::PROTECTED_ENDPOINTS)?)
            .map_err(|e| Error::internal(format!("endpoint map: {e}")))?;
        let blacklist = KernelHashMap::try_from(take_map(ebpf, map_names::BLACKLIST)?)
            .map_err(|e| Error::internal(format!("blacklist map: {e}")))?;
        let conntrack = KernelHashMap::try_from(take_map(ebpf, map_names::CONNTRACK)?)
            .map_err(|e| Error::internal(format!("conntrack map: {e}")))?;
        let challenges = KernelHashMap::try_from(take_map(ebpf, map_names::UDP_CHALLENGES)?)
            .map_err(|e| Error::internal(format!("challenge map: {e}")))?;
        let stats = PerCpuArray::try_from(take_map(ebpf, map_names::STATS)?)
            .map_err(|e| Error::internal(format!("stats map: {e}")))?;

        Ok(Self {
            kernel: Some(KernelHandles {
                endpoints: Mutex::new(endpoints),
                blacklist: Mutex::new(blacklist),
                conntrack: Mutex::new(conntrack),
                challenges: Mutex::new(challenges),
                stats: Mutex::new(stats),
            }),
            endpoints: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
        })
    }

    /// Mirror-only synchronizer with no kernel maps attached.
    pub fn standalone() -> Self {
        Self {
            kernel: None,
            endpoints: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    pub fn add_endpoint(&self, spec: EndpointSpec) -> Result<()> {
        spec.validate()?;
        let key = spec.map_key();

        {
            let endpoints = self.endpoints.read();
            if endpoints.contains_key(&key) {
                return Err(Error::already_exists(
                    "Endpoint",
                    "front",
                    format!(
                        "{}:{}/{}",
                        spec.front_ip,
                        spec.front_port,
                        spec.kind.as_str()
                    ),
                ));
            }
            if endpoints.values().any(|existing| existing.id == spec.id) {
                return Err(Error::already_exists("Endpoint", "id", spec.id.clone()));
            }
        }

        self.kernel_upsert(&key, &spec.map_info())?;
        info!(endpoint_id = %spec.id, front = %spec.front_ip, port = spec.front_port, "Endpoint added to maps");
        self.endpoints.write().insert(key, spec);
        Ok(())
    }

    /// Replace the policy at the endpoint's front key. A packet between the
    /// old and new value sees exactly one of the two.
    pub fn update_endpoint(&self, spec: EndpointSpec) -> Result<()> {
        spec.validate()?;
        let key = spec.map_key();

        let previous_key = {
            let endpoints = self.endpoints.read();
            endpoints
                .iter()
                .find(|(_, existing)| existing.id == spec.id)
                .map(|(k, _)| *k)
        };
        let previous_key =
            previous_key.ok_or_else(|| Error::not_found("Endpoint", spec.id.clone()))?;

        self.kernel_upsert(&key, &spec.map_info())?;
        if previous_key != key {
            // The front tuple moved; the stale slot must go away after the
            // new one is live.
            self.kernel_remove_endpoint(&previous_key)?;
            self.endpoints.write().remove(&previous_key);
        }

        debug!(endpoint_id = %spec.id, "Endpoint policy updated");
        self.endpoints.write().insert(key, spec);
        Ok(())
    }

    pub fn remove_endpoint(&self, id: &str) -> Result<EndpointSpec> {
        let key = {
            let endpoints = self.endpoints.read();
            endpoints
                .iter()
                .find(|(_, existing)| existing.id == id)
                .map(|(k, _)| *k)
        };
        let key = key.ok_or_else(|| Error::not_found("Endpoint", id))?;

        self.kernel_remove_endpoint(&key)?;
        let spec = self.endpoints.write().remove(&key);
        info!(endpoint_id = %id, "Endpoint removed from maps");
        spec.ok_or_else(|| Error::not_found("Endpoint", id))
    }

    pub fn endpoints(&self) -> Vec<EndpointSpec> {
        self.endpoints.read().values().cloned().collect()
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.read().values().map(|e| e.id.clone()).collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    fn kernel_upsert(&self, key: &EndpointKey, info: &EndpointInfo) -> Result<()> {
        if let Some(kernel) = &self.kernel {
            let mut map = kernel.endpoints.lock();
            map.insert(&Key::new(ENDPOINT_KEY_BITS, *key), info, 0)
                .map_err(|e| Error::resource_exhausted(format!("endpoint map insert: {e}")))?;
        }
        Ok(())
    }

    fn kernel_remove_endpoint(&self, key: &EndpointKey) -> Result<()> {
        if let Some(kernel) = &self.kernel {
            let mut map = kernel.endpoints.lock();
            if let Err(e) = map.remove(&Key::new(ENDPOINT_KEY_BITS, *key)) {
                warn!("endpoint map remove: {e}");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------

    pub fn add_blacklist(&self, ip: Ipv4Addr, ttl_ms: u64) -> Result<()> {
        let blocked_until = monotonic_ms().saturating_add(ttl_ms);

        if let Some(kernel) = &self.kernel {
            let mut map = kernel.blacklist.lock();
            map.insert(u32::from(ip), blocked_until, 0)
                .map_err(|e| Error::resource_exhausted(format!("blacklist insert: {e}")))?;
        }

        info!(%ip, ttl_ms, "Source blacklisted");
        self.blacklist.write().insert(ip, blocked_until);
        Ok(())
    }

    pub fn remove_blacklist(&self, ip: Ipv4Addr) -> Result<()> {
        if let Some(kernel) = &self.kernel {
            let mut map = kernel.blacklist.lock();
            let _ = map.remove(&u32::from(ip));
        }

        if self.blacklist.write().remove(&ip).is_none() {
            return Err(Error::not_found("Blacklist entry", ip.to_string()));
        }
        info!(%ip, "Source removed from blacklist");
        Ok(())
    }

    pub fn blacklist(&self) -> Vec<(Ipv4Addr, u64)> {
        self.blacklist
            .read()
            .iter()
            .map(|(ip, until)| (*ip, *until))
            .collect()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.read().len()
    }

    // ------------------------------------------------------------------
    // Counters and reaping
    // ------------------------------------------------------------------

    /// Sum the per-CPU counter slots. Values are monotonic approximations,
    /// not a transactional snapshot.
    pub fn read_counters(&self) -> Result<CounterSnapshot> {
        let mut slots = [0u64; stat::COUNT as usize];

        if let Some(kernel) = &self.kernel {
            let stats = kernel.stats.lock();
            for (slot, value) in slots.iter_mut().enumerate() {
                let per_cpu = stats
                    .get(&(slot as u32), 0)
                    .map_err(|e| Error::internal(format!("stats read: {e}")))?;
                *value = per_cpu.iter().sum();
            }
        }

        Ok(CounterSnapshot::from(slots))
    }

    /// Walk the expiring tables and delete stale rows: blacklist entries past
    /// `blocked_until`, flows idle past their per-kind timeout, challenge
    /// records past the 5 s window.
    pub fn reap_expired(&self) -> Result<ReapSummary> {
        let now = monotonic_ms();
        let mut summary = ReapSummary::default();

        if let Some(kernel) = &self.kernel {
            {
                let mut map = kernel.blacklist.lock();
                let expired: Vec<u32> = map
                    .iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|(_, until)| *until <= now)
                    .map(|(ip, _)| ip)
                    .collect();
                for ip in expired {
                    if map.remove(&ip).is_ok() {
                        summary.blacklist += 1;
                    }
                }
            }

            {
                let mut map = kernel.conntrack.lock();
                let idle: Vec<u64> = map
                    .iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|(_, flow)| {
                        now.saturating_sub(flow.last_seen_ms) >= flow.idle_timeout_ms()
                    })
                    .map(|(hash, _)| hash)
                    .collect();
                for hash in idle {
                    if map.remove(&hash).is_ok() {
                        summary.conntrack += 1;
                    }
                }
            }

            {
                let mut map = kernel.challenges.lock();
                let stale: Vec<u32> = map
                    .iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|(_, record)| now.saturating_sub(record.issued_ms) > CHALLENGE_WINDOW_MS)
                    .map(|(ip, _)| ip)
                    .collect();
                for ip in stale {
                    if map.remove(&ip).is_ok() {
                        summary.challenges += 1;
                    }
                }
            }
        }

        self.blacklist.write().retain(|_, until| *until > now);

        if summary.total() > 0 {
            debug!(
                blacklist = summary.blacklist,
                conntrack = summary.conntrack,
                challenges = summary.challenges,
                "Reaped expired map entries"
            );
        }
        Ok(summary)
    }
}

/// What one reaper pass removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReapSummary {
    pub blacklist: u64,
    pub conntrack: u64,
    pub challenges: u64,
}

impl ReapSummary {
    pub fn total(&self) -> u64 {
        self.blacklist + self.conntrack + self.challenges
    }
}
