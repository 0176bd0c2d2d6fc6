//! XDP fast-path filter for protected Minecraft endpoints.
//!
//! Per packet: parse L2-L4, consult the blacklist, look up the protected
//! endpoint, enforce the per-source token bucket, validate the Minecraft
//! handshake (Java) or RakNet frame plus UDP cookie challenge (Bedrock),
//! update conntrack and emit a verdict. Accepted packets are handed to the
//! host stack where the user-space relay owns the front socket; the
//! `redirect` counter keeps the relay-bound share visible.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::{lpm_trie::Key, HashMap, LpmTrie, LruHashMap, PerCpuArray},
    programs::XdpContext,
};
use core::mem;

use obsidianprotection_ebpf::{
    challenge_decision, hash_flow, mix_cookie, refill_and_take, stat, validate_bedrock_frame,
    validate_java_handshake, ChallengeAction, ConntrackEntry, EndpointInfo, EndpointKey,
    RateLimitState, UdpChallengeState, BLACKLIST_MAX, CONNTRACK_MAX, CT_ESTABLISHED, CT_NEW,
    ENDPOINTS_MAX, ENDPOINT_KEY_BITS, ETH_P_IP, IPPROTO_TCP, IPPROTO_UDP, KIND_BEDROCK, KIND_JAVA,
    SRC_RATE_MAX, UDP_CHALLENGES_MAX,
};

const BPF_F_NO_PREALLOC: u32 = 1;

// Network header layouts.

#[repr(C)]
struct EthHdr {
    h_dest: [u8; 6],
    h_source: [u8; 6],
    h_proto: u16,
}

#[repr(C)]
struct Ipv4Hdr {
    version_ihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

#[repr(C)]
struct TcpHdr {
    source: u16,
    dest: u16,
    seq: u32,
    ack_seq: u32,
    doff_flags: u16,
    window: u16,
    check: u16,
    urg_ptr: u16,
}

#[repr(C)]
struct UdpHdr {
    source: u16,
    dest: u16,
    len: u16,
    check: u16,
}

// Shared maps. Names are the published interface consumed by the loader,
// the map synchronizer and xdpctl.

#[map(name = "map_protected_endpoints")]
static PROTECTED_ENDPOINTS: LpmTrie<EndpointKey, EndpointInfo> =
    LpmTrie::with_max_entries(ENDPOINTS_MAX, BPF_F_NO_PREALLOC);

#[map(name = "map_src_rate")]
static SRC_RATE: LruHashMap<u32, RateLimitState> = LruHashMap::with_max_entries(SRC_RATE_MAX, 0);

#[map(name = "map_conntrack")]
static CONNTRACK: LruHashMap<u64, ConntrackEntry> = LruHashMap::with_max_entries(CONNTRACK_MAX, 0);

#[map(name = "map_blacklist")]
static BLACKLIST: HashMap<u32, u64> = HashMap::with_max_entries(BLACKLIST_MAX, 0);

#[map(name = "map_udp_challenges")]
static UDP_CHALLENGES: HashMap<u32, UdpChallengeState> =
    HashMap::with_max_entries(UDP_CHALLENGES_MAX, 0);

#[map(name = "map_stats")]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(stat::COUNT, 0);

#[xdp]
pub fn minecraft_filter(ctx: XdpContext) -> u32 {
    match try_minecraft_filter(ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_DROP,
    }
}

/// Parsed transport view of the packet.
struct Parsed {
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    payload_start: usize,
}

#[inline(always)]
fn try_minecraft_filter(ctx: XdpContext) -> Result<u32, ()> {
    let data = ctx.data();
    let data_end = ctx.data_end();

    // Parse. Non-IPv4 traffic is none of our business; truncated headers
    // on the protected path are dropped outright.
    if data + mem::size_of::<EthHdr>() > data_end {
        return Ok(xdp_action::XDP_DROP);
    }
    let eth = unsafe { &*(data as *const EthHdr) };
    if u16::from_be(eth.h_proto) != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }

    let ip_start = data + mem::size_of::<EthHdr>();
    if ip_start + mem::size_of::<Ipv4Hdr>() > data_end {
        return Ok(xdp_action::XDP_DROP);
    }
    let ip = unsafe { &*(ip_start as *const Ipv4Hdr) };
    let ihl = ((ip.version_ihl & 0x0f) as usize) * 4;
    if ihl < mem::size_of::<Ipv4Hdr>() || ip_start + ihl > data_end {
        return Ok(xdp_action::XDP_DROP);
    }

    let l4_start = ip_start + ihl;
    let parsed = match ip.protocol {
        IPPROTO_TCP => {
            if l4_start + mem::size_of::<TcpHdr>() > data_end {
                return Ok(xdp_action::XDP_DROP);
            }
            let tcp = unsafe { &*(l4_start as *const TcpHdr) };
            let doff = (((u16::from_be(tcp.doff_flags) >> 12) & 0x0f) as usize) * 4;
            if doff < mem::size_of::<TcpHdr>() || l4_start + doff > data_end {
                return Ok(xdp_action::XDP_DROP);
            }
            Parsed {
                src_ip: u32::from_be(ip.saddr),
                dst_ip: u32::from_be(ip.daddr),
                src_port: u16::from_be(tcp.source),
                dst_port: u16::from_be(tcp.dest),
                protocol: IPPROTO_TCP,
                payload_start: l4_start + doff,
            }
        }
        IPPROTO_UDP => {
            if l4_start + mem::size_of::<UdpHdr>() > data_end {
                return Ok(xdp_action::XDP_DROP);
            }
            let udp = unsafe { &*(l4_start as *const UdpHdr) };
            Parsed {
                src_ip: u32::from_be(ip.saddr),
                dst_ip: u32::from_be(ip.daddr),
                src_port: u16::from_be(udp.source),
                dst_port: u16::from_be(udp.dest),
                protocol: IPPROTO_UDP,
                payload_start: l4_start + mem::size_of::<UdpHdr>(),
            }
        }
        // Not TCP/UDP: cannot target a protected endpoint.
        _ => return Ok(xdp_action::XDP_PASS),
    };

    bump(stat::TOTAL_PACKETS);

    let now_ms = now_ms();

    // Blacklist, with lazy expiry.
    if let Some(blocked_until) = unsafe { BLACKLIST.get(&parsed.src_ip) } {
        if now_ms < *blocked_until {
            bump(stat::DROPPED_BLACKLIST);
            return Ok(xdp_action::XDP_DROP);
        }
        let _ = BLACKLIST.remove(&parsed.src_ip);
    }

    // Endpoint lookup by front tuple.
    let key = Key::new(
        ENDPOINT_KEY_BITS,
        EndpointKey::new(parsed.dst_ip, parsed.dst_port, parsed.protocol),
    );
    let endpoint = match PROTECTED_ENDPOINTS.get(&key) {
        Some(endpoint) => *endpoint,
        None => {
            bump(stat::PASS);
            return Ok(xdp_action::XDP_PASS);
        }
    };

    if endpoint.maintenance != 0 {
        bump(stat::DROPPED_MAINTENANCE);
        return Ok(xdp_action::XDP_DROP);
    }

    // Per-source token bucket.
    if let Some(bucket) = unsafe { SRC_RATE.get_ptr_mut(&parsed.src_ip) } {
        let bucket = unsafe { &mut *bucket };
        if !refill_and_take(bucket, now_ms, endpoint.rate_limit, endpoint.burst_limit) {
            bump(stat::DROPPED_RATELIMIT);
            return Ok(xdp_action::XDP_DROP);
        }
    } else {
        let mut bucket = RateLimitState::full(now_ms, endpoint.burst_limit);
        let _ = refill_and_take(&mut bucket, now_ms, endpoint.rate_limit, endpoint.burst_limit);
        if SRC_RATE.insert(&parsed.src_ip, &bucket, 0).is_err() {
            bump(stat::SATURATION);
            return Ok(xdp_action::XDP_DROP);
        }
    }

    // Established flows bypass revalidation.
    let flow = hash_flow(
        parsed.src_ip,
        parsed.dst_ip,
        parsed.src_port,
        parsed.dst_port,
        parsed.protocol,
    );
    if let Some(entry) = unsafe { CONNTRACK.get_ptr_mut(&flow) } {
        let entry = unsafe { &mut *entry };
        if entry.state == CT_ESTABLISHED {
            entry.last_seen_ms = now_ms;
            bump(stat::ALLOWED);
            bump(stat::REDIRECT);
            return Ok(xdp_action::XDP_PASS);
        }
    }

    // Kind validation on fresh flows.
    let mut ct_state = CT_ESTABLISHED;
    match endpoint.kind {
        KIND_JAVA => {
            if parsed.protocol != IPPROTO_TCP {
                bump(stat::DROPPED_BADPROTO);
                return Ok(xdp_action::XDP_DROP);
            }
            if parsed.payload_start >= data_end {
                // Bare SYN/ACK segments carry no handshake yet; let the TCP
                // handshake reach the relay without promoting the flow.
                ct_state = CT_NEW;
            } else {
                let payload = unsafe {
                    core::slice::from_raw_parts(
                        parsed.payload_start as *const u8,
                        data_end - parsed.payload_start,
                    )
                };
                if !validate_java_handshake(payload) {
                    bump(stat::DROPPED_BADPROTO);
                    return Ok(xdp_action::XDP_DROP);
                }
            }
        }
        KIND_BEDROCK => {
            if parsed.protocol != IPPROTO_UDP {
                bump(stat::DROPPED_BADPROTO);
                return Ok(xdp_action::XDP_DROP);
            }
            if parsed.payload_start >= data_end {
                bump(stat::DROPPED_BADPROTO);
                return Ok(xdp_action::XDP_DROP);
            }
            let payload = unsafe {
                core::slice::from_raw_parts(
                    parsed.payload_start as *const u8,
                    data_end - parsed.payload_start,
                )
            };
            if !validate_bedrock_frame(payload) {
                bump(stat::DROPPED_BADPROTO);
                return Ok(xdp_action::XDP_DROP);
            }

            let record = unsafe { UDP_CHALLENGES.get(&parsed.src_ip) };
            match challenge_decision(record, now_ms) {
                ChallengeAction::Issue | ChallengeAction::Reissue => {
                    let fresh = UdpChallengeState {
                        issued_ms: now_ms,
                        cookie: mix_cookie(now_ms, parsed.src_ip),
                        pad: 0,
                    };
                    if UDP_CHALLENGES.insert(&parsed.src_ip, &fresh, 0).is_err() {
                        bump(stat::SATURATION);
                        return Ok(xdp_action::XDP_DROP);
                    }
                    bump(stat::CHALLENGES_SENT);
                    bump(stat::DROPPED_CHALLENGE);
                    return Ok(xdp_action::XDP_DROP);
                }
                ChallengeAction::Hold => {
                    bump(stat::DROPPED_CHALLENGE);
                    return Ok(xdp_action::XDP_DROP);
                }
                ChallengeAction::Pass => {
                    let _ = UDP_CHALLENGES.remove(&parsed.src_ip);
                    bump(stat::CHALLENGES_PASSED);
                }
            }
        }
        _ => {
            bump(stat::DROPPED_BADPROTO);
            return Ok(xdp_action::XDP_DROP);
        }
    }

    // Conntrack: first writer wins, later packets update the existing entry.
    if let Some(entry) = unsafe { CONNTRACK.get_ptr_mut(&flow) } {
        let entry = unsafe { &mut *entry };
        entry.last_seen_ms = now_ms;
        if ct_state == CT_ESTABLISHED {
            entry.state = CT_ESTABLISHED;
        }
    } else {
        let entry = ConntrackEntry {
            created_ms: now_ms,
            last_seen_ms: now_ms,
            front_ip: parsed.dst_ip,
            front_port: parsed.dst_port,
            kind: endpoint.kind,
            state: ct_state,
        };
        if CONNTRACK.insert(&flow, &entry, 0).is_err() {
            bump(stat::SATURATION);
            return Ok(xdp_action::XDP_DROP);
        }
    }

    bump(stat::ALLOWED);
    bump(stat::REDIRECT);
    Ok(xdp_action::XDP_PASS)
}

#[inline(always)]
fn now_ms() -> u64 {
    unsafe { bpf_ktime_get_ns() / 1_000_000 }
}

#[inline(always)]
fn bump(slot: u32) {
    if let Some(counter) = STATS.get_ptr_mut(slot) {
        unsafe {
            *counter += 1;
        }
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
