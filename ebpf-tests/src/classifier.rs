//! Userspace model of the XDP classifier.
//!
//! Replays the kernel program's decision pipeline step for step over
//! in-memory tables, using the same shared validation and bucket logic, with
//! an injectable clock. The tests below pin down the filter's observable
//! contract: verdicts, counter accounting and state transitions.

use std::collections::HashMap;

use obsidianprotection_ebpf::{
    challenge_decision, hash_flow, mix_cookie, refill_and_take, stat, validate_bedrock_frame,
    validate_java_handshake, ChallengeAction, ConntrackEntry, EndpointInfo, EndpointKey,
    RateLimitState, UdpChallengeState, BLACKLIST_MAX, CHALLENGE_WINDOW_MS, CT_ESTABLISHED, CT_NEW,
    ENDPOINTS_MAX, ETH_P_IP, IPPROTO_TCP, IPPROTO_UDP, KIND_BEDROCK, KIND_JAVA,
    UDP_CHALLENGES_MAX,
};

/// Fast-path verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Pass,
    Redirect,
}

/// In-memory stand-in for the shared kernel maps.
pub struct ClassifierModel {
    endpoints: HashMap<EndpointKey, EndpointInfo>,
    src_rate: HashMap<u32, RateLimitState>,
    conntrack: HashMap<u64, ConntrackEntry>,
    blacklist: HashMap<u32, u64>,
    challenges: HashMap<u32, UdpChallengeState>,
    challenge_capacity: usize,
    stats: [u64; stat::COUNT as usize],
}

impl Default for ClassifierModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierModel {
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
            src_rate: HashMap::new(),
            conntrack: HashMap::new(),
            blacklist: HashMap::new(),
            challenges: HashMap::new(),
            challenge_capacity: UDP_CHALLENGES_MAX as usize,
            stats: [0; stat::COUNT as usize],
        }
    }

    /// Shrink the challenge table, for saturation tests.
    pub fn with_challenge_capacity(mut self, capacity: usize) -> Self {
        self.challenge_capacity = capacity;
        self
    }

    pub fn stat(&self, slot: u32) -> u64 {
        self.stats[slot as usize]
    }

    fn bump(&mut self, slot: u32) {
        self.stats[slot as usize] += 1;
    }

    // Control-plane side mutations, mirroring the map synchronizer.

    pub fn upsert_endpoint(&mut self, key: EndpointKey, info: EndpointInfo) -> Result<(), ()> {
        if !self.endpoints.contains_key(&key) && self.endpoints.len() >= ENDPOINTS_MAX as usize {
            return Err(());
        }
        self.endpoints.insert(key, info);
        Ok(())
    }

    pub fn remove_endpoint(&mut self, key: &EndpointKey) -> bool {
        self.endpoints.remove(key).is_some()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn add_blacklist(&mut self, ip: u32, blocked_until_ms: u64) -> Result<(), ()> {
        if !self.blacklist.contains_key(&ip) && self.blacklist.len() >= BLACKLIST_MAX as usize {
            return Err(());
        }
        self.blacklist.insert(ip, blocked_until_ms);
        Ok(())
    }

    pub fn remove_blacklist(&mut self, ip: u32) -> bool {
        self.blacklist.remove(&ip).is_some()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    pub fn conntrack_len(&self) -> usize {
        self.conntrack.len()
    }

    pub fn challenge_len(&self) -> usize {
        self.challenges.len()
    }

    /// Periodic reaper: expired blacklist rows, idle flows, stale challenges.
    pub fn reap(&mut self, now_ms: u64) {
        self.blacklist.retain(|_, until| *until > now_ms);
        self.conntrack
            .retain(|_, entry| now_ms.saturating_sub(entry.last_seen_ms) < entry.idle_timeout_ms());
        self.challenges
            .retain(|_, record| now_ms.saturating_sub(record.issued_ms) <= CHALLENGE_WINDOW_MS);
    }

    /// Run one frame through the pipeline.
    pub fn process(&mut self, frame: &[u8], now_ms: u64) -> Verdict {
        // Parse.
        if frame.len() < 14 {
            return Verdict::Drop;
        }
        let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
        if ether_type != ETH_P_IP {
            return Verdict::Pass;
        }
        let ip = &frame[14..];
        if ip.len() < 20 {
            return Verdict::Drop;
        }
        let ihl = ((ip[0] & 0x0f) as usize) * 4;
        if ihl < 20 || ip.len() < ihl {
            return Verdict::Drop;
        }
        let protocol = ip[9];
        let src_ip = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
        let dst_ip = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);

        let l4 = &ip[ihl..];
        let (src_port, dst_port, payload) = match protocol {
            IPPROTO_TCP => {
                if l4.len() < 20 {
                    return Verdict::Drop;
                }
                let doff = (((u16::from_be_bytes([l4[12], l4[13]]) >> 12) & 0x0f) as usize) * 4;
                if doff < 20 || l4.len() < doff {
                    return Verdict::Drop;
                }
                (
                    u16::from_be_bytes([l4[0], l4[1]]),
                    u16::from_be_bytes([l4[2], l4[3]]),
                    &l4[doff..],
                )
            }
            IPPROTO_UDP => {
                if l4.len() < 8 {
                    return Verdict::Drop;
                }
                (
                    u16::from_be_bytes([l4[0], l4[1]]),
                    u16::from_be_bytes([l4[2], l4[3]]),
                    &l4[8..],
                )
            }
            _ => return Verdict::Pass,
        };
        let payload = payload.to_vec();

        self.bump(stat::TOTAL_PACKETS);

        // Blacklist with lazy expiry.
        if let Some(blocked_until) = self.blacklist.get(&src_ip).copied() {
            if now_ms < blocked_until {
                self.bump(stat::DROPPED_BLACKLIST);
                return Verdict::Drop;
            }
            self.blacklist.remove(&src_ip);
        }

        // Endpoint lookup.
        let key = EndpointKey::new(dst_ip, dst_port, protocol);
        let endpoint = match self.endpoints.get(&key).copied() {
            Some(endpoint) => endpoint,
            None => {
                self.bump(stat::PASS);
                return Verdict::Pass;
            }
        };

        if endpoint.maintenance != 0 {
            self.bump(stat::DROPPED_MAINTENANCE);
            return Verdict::Drop;
        }

        // Token bucket.
        let bucket = self
            .src_rate
            .entry(src_ip)
            .or_insert_with(|| RateLimitState::full(now_ms, endpoint.burst_limit));
        if !refill_and_take(bucket, now_ms, endpoint.rate_limit, endpoint.burst_limit) {
            self.bump(stat::DROPPED_RATELIMIT);
            return Verdict::Drop;
        }

        // Established-flow bypass.
        let flow = hash_flow(src_ip, dst_ip, src_port, dst_port, protocol);
        if let Some(entry) = self.conntrack.get_mut(&flow) {
            if entry.state == CT_ESTABLISHED {
                entry.last_seen_ms = now_ms;
                self.bump(stat::ALLOWED);
                self.bump(stat::REDIRECT);
                return Verdict::Redirect;
            }
        }

        // Kind validation.
        let mut ct_state = CT_ESTABLISHED;
        match endpoint.kind {
            KIND_JAVA => {
                if protocol != IPPROTO_TCP {
                    self.bump(stat::DROPPED_BADPROTO);
                    return Verdict::Drop;
                }
                if payload.is_empty() {
                    ct_state = CT_NEW;
                } else if !validate_java_handshake(&payload) {
                    self.bump(stat::DROPPED_BADPROTO);
                    return Verdict::Drop;
                }
            }
            KIND_BEDROCK => {
                if protocol != IPPROTO_UDP || !validate_bedrock_frame(&payload) {
                    self.bump(stat::DROPPED_BADPROTO);
                    return Verdict::Drop;
                }
                match challenge_decision(self.challenges.get(&src_ip), now_ms) {
                    ChallengeAction::Issue | ChallengeAction::Reissue => {
                        if !self.challenges.contains_key(&src_ip)
                            && self.challenges.len() >= self.challenge_capacity
                        {
                            self.bump(stat::SATURATION);
                            return Verdict::Drop;
                        }
                        self.challenges.insert(
                            src_ip,
                            UdpChallengeState {
                                issued_ms: now_ms,
                                cookie: mix_cookie(now_ms, src_ip),
                                pad: 0,
                            },
                        );
                        self.bump(stat::CHALLENGES_SENT);
                        self.bump(stat::DROPPED_CHALLENGE);
                        return Verdict::Drop;
                    }
                    ChallengeAction::Hold => {
                        self.bump(stat::DROPPED_CHALLENGE);
                        return Verdict::Drop;
                    }
                    ChallengeAction::Pass => {
                        self.challenges.remove(&src_ip);
                        self.bump(stat::CHALLENGES_PASSED);
                    }
                }
            }
            _ => {
                self.bump(stat::DROPPED_BADPROTO);
                return Verdict::Drop;
            }
        }

        // Conntrack.
        if let Some(entry) = self.conntrack.get_mut(&flow) {
            entry.last_seen_ms = now_ms;
            if ct_state == CT_ESTABLISHED {
                entry.state = CT_ESTABLISHED;
            }
        } else {
            self.conntrack.insert(
                flow,
                ConntrackEntry {
                    created_ms: now_ms,
                    last_seen_ms: now_ms,
                    front_ip: dst_ip,
                    front_port: dst_port,
                    kind: endpoint.kind,
                    state: ct_state,
                },
            );
        }

        self.bump(stat::ALLOWED);
        self.bump(stat::REDIRECT);
        Verdict::Redirect
    }

    /// Counter identity from the filter contract: everything that was counted
    /// as seen either passed, was accepted, or was dropped for a counted
    /// reason.
    pub fn assert_counter_identity(&self) {
        let accounted = self.stat(stat::PASS)
            + self.stat(stat::ALLOWED)
            + self.stat(stat::DROPPED_RATELIMIT)
            + self.stat(stat::DROPPED_BLACKLIST)
            + self.stat(stat::DROPPED_BADPROTO)
            + self.stat(stat::DROPPED_CHALLENGE)
            + self.stat(stat::DROPPED_MAINTENANCE)
            + self.stat(stat::SATURATION);
        assert_eq!(
            accounted,
            self.stat(stat::TOTAL_PACKETS),
            "counter identity violated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_generator::*;
    use std::net::Ipv4Addr;

    const FRONT_IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 10);
    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 77);
    const JAVA_PORT: u16 = 25565;
    const BEDROCK_PORT: u16 = 19132;

    fn java_endpoint() -> (EndpointKey, EndpointInfo) {
        (
            EndpointKey::new(u32::from(FRONT_IP), JAVA_PORT, IPPROTO_TCP),
            EndpointInfo {
                origin_ip: u32::from(Ipv4Addr::new(203, 0, 113, 5)),
                origin_port: 25565,
                kind: KIND_JAVA,
                maintenance: 0,
                rate_limit: 1000,
                burst_limit: 5000,
            },
        )
    }

    fn bedrock_endpoint() -> (EndpointKey, EndpointInfo) {
        (
            EndpointKey::new(u32::from(FRONT_IP), BEDROCK_PORT, IPPROTO_UDP),
            EndpointInfo {
                origin_ip: u32::from(Ipv4Addr::new(203, 0, 113, 5)),
                origin_port: 19132,
                kind: KIND_BEDROCK,
                maintenance: 0,
                rate_limit: 1000,
                burst_limit: 5000,
            },
        )
    }

    fn handshake_frame(src_port: u16) -> Vec<u8> {
        let payload = java_handshake(760, "", JAVA_PORT, 2);
        tcp_frame(
            CLIENT_IP,
            FRONT_IP,
            src_port,
            JAVA_PORT,
            TCP_ACK | TCP_PSH,
            &payload,
        )
    }

    #[test]
    fn unmatched_traffic_passes() {
        let mut model = ClassifierModel::new();
        let frame = handshake_frame(40000);
        assert_eq!(model.process(&frame, 0), Verdict::Pass);
        assert_eq!(model.stat(stat::PASS), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn non_ipv4_passes_uncounted() {
        let mut model = ClassifierModel::new();
        assert_eq!(model.process(&arp_frame(), 0), Verdict::Pass);
        assert_eq!(model.stat(stat::TOTAL_PACKETS), 0);
    }

    #[test]
    fn happy_java_redirects() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        assert_eq!(model.process(&handshake_frame(40000), 0), Verdict::Redirect);
        assert_eq!(model.stat(stat::ALLOWED), 1);
        assert_eq!(model.stat(stat::REDIRECT), 1);
        assert_eq!(model.stat(stat::TOTAL_PACKETS), 1);
        assert_eq!(model.conntrack_len(), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn established_flow_bypasses_validation() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        assert_eq!(model.process(&handshake_frame(40000), 0), Verdict::Redirect);

        // Garbage payload on the same 5-tuple rides the established entry.
        let garbage = tcp_frame(
            CLIENT_IP,
            FRONT_IP,
            40000,
            JAVA_PORT,
            TCP_ACK | TCP_PSH,
            &[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02],
        );
        assert_eq!(model.process(&garbage, 10), Verdict::Redirect);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 0);
        model.assert_counter_identity();
    }

    #[test]
    fn bare_syn_reaches_relay_without_promotion() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let syn = tcp_frame(CLIENT_IP, FRONT_IP, 40000, JAVA_PORT, TCP_SYN, &[]);
        assert_eq!(model.process(&syn, 0), Verdict::Redirect);

        // The flow is not yet established: garbage still gets validated.
        let garbage = tcp_frame(
            CLIENT_IP,
            FRONT_IP,
            40000,
            JAVA_PORT,
            TCP_ACK | TCP_PSH,
            &[0xff; 8],
        );
        assert_eq!(model.process(&garbage, 5), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn rate_limit_bounds_allowed_packets() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        // 6000 valid handshakes inside 100 ms from one source.
        let mut allowed = 0;
        let mut dropped = 0;
        for i in 0..6000u32 {
            let frame = handshake_frame(30000 + (i % 20000) as u16);
            match model.process(&frame, (i as u64) / 60) {
                Verdict::Redirect => allowed += 1,
                Verdict::Drop => dropped += 1,
                Verdict::Pass => panic!("protected traffic must not pass"),
            }
        }

        // Bound: burst + rate over the 100 ms window, with slack for refill.
        assert!(allowed <= 5000 + 100 + 1, "allowed = {allowed}");
        assert!(dropped >= 900, "dropped = {dropped}");
        assert_eq!(model.stat(stat::DROPPED_RATELIMIT), dropped);
        model.assert_counter_identity();
    }

    #[test]
    fn blacklist_blocks_until_expiry() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let src = u32::from(CLIENT_IP);
        model.add_blacklist(src, 60_000).unwrap();

        assert_eq!(model.process(&handshake_frame(40000), 1_000), Verdict::Drop);
        assert_eq!(model.process(&handshake_frame(40001), 59_999), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BLACKLIST), 2);

        // After expiry the reaper clears the row and policy applies again.
        model.reap(60_000);
        assert_eq!(model.blacklist_len(), 0);
        assert_eq!(
            model.process(&handshake_frame(40002), 60_001),
            Verdict::Redirect
        );
        model.assert_counter_identity();
    }

    #[test]
    fn expired_blacklist_entry_is_lazily_removed() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        model.add_blacklist(u32::from(CLIENT_IP), 100).unwrap();
        // No reaper run; the packet itself clears the stale row.
        assert_eq!(model.process(&handshake_frame(40000), 200), Verdict::Redirect);
        assert_eq!(model.blacklist_len(), 0);
    }

    #[test]
    fn maintenance_drops_and_recovers() {
        let mut model = ClassifierModel::new();
        let (key, mut info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        info.maintenance = 1;
        model.upsert_endpoint(key, info).unwrap();
        assert_eq!(model.process(&handshake_frame(40000), 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_MAINTENANCE), 1);

        info.maintenance = 0;
        model.upsert_endpoint(key, info).unwrap();
        assert_eq!(model.process(&handshake_frame(40001), 10), Verdict::Redirect);
        model.assert_counter_identity();
    }

    #[test]
    fn policy_update_is_visible_to_next_packet() {
        let mut model = ClassifierModel::new();
        let (key, mut info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        info.rate_limit = 1;
        info.burst_limit = 1;
        model.upsert_endpoint(key, info).unwrap();

        assert_eq!(model.process(&handshake_frame(40000), 0), Verdict::Redirect);
        // Fresh source so the old bucket does not mask the new policy.
        let other_client = Ipv4Addr::new(203, 0, 113, 99);
        let payload = java_handshake(760, "", JAVA_PORT, 2);
        let f1 = tcp_frame(other_client, FRONT_IP, 40001, JAVA_PORT, TCP_PSH, &payload);
        let f2 = tcp_frame(other_client, FRONT_IP, 40002, JAVA_PORT, TCP_PSH, &payload);
        assert_eq!(model.process(&f1, 0), Verdict::Redirect);
        assert_eq!(model.process(&f2, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_RATELIMIT), 1);
    }

    #[test]
    fn truncated_ipv4_header_drops() {
        let mut model = ClassifierModel::new();
        let mut frame = handshake_frame(40000);
        frame.truncate(14 + 10);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::TOTAL_PACKETS), 0);
    }

    #[test]
    fn truncated_tcp_header_drops() {
        let mut model = ClassifierModel::new();
        let mut frame = handshake_frame(40000);
        frame.truncate(14 + 20 + 8);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
    }

    #[test]
    fn tcp_to_bedrock_kind_drops_badproto() {
        let mut model = ClassifierModel::new();
        // Misconfigured endpoint: bedrock kind registered on a TCP front.
        let (_, info) = bedrock_endpoint();
        let key = EndpointKey::new(u32::from(FRONT_IP), BEDROCK_PORT, IPPROTO_TCP);
        model.upsert_endpoint(key, info).unwrap();

        let frame = tcp_frame(CLIENT_IP, FRONT_IP, 40000, BEDROCK_PORT, TCP_PSH, &[0x05]);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn java_length_five_boundary() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        // Declared length exactly 5 with id 0x00 and version in range.
        let ok = java_handshake_raw(5, 0x00, 760);
        let frame = tcp_frame(CLIENT_IP, FRONT_IP, 40000, JAVA_PORT, TCP_PSH, &ok);
        assert_eq!(model.process(&frame, 0), Verdict::Redirect);

        // Wrong packet id.
        let bad_id = java_handshake_raw(5, 0x01, 760);
        let frame = tcp_frame(CLIENT_IP, FRONT_IP, 40001, JAVA_PORT, TCP_PSH, &bad_id);
        assert_eq!(model.process(&frame, 1), Verdict::Drop);

        // Version outside [4, 1000].
        let bad_version = java_handshake_raw(5, 0x00, 2000);
        let frame = tcp_frame(CLIENT_IP, FRONT_IP, 40002, JAVA_PORT, TCP_PSH, &bad_version);
        assert_eq!(model.process(&frame, 2), Verdict::Drop);

        // Declared length below the minimum.
        let too_short = java_handshake_raw(4, 0x00, 760);
        let frame = tcp_frame(CLIENT_IP, FRONT_IP, 40003, JAVA_PORT, TCP_PSH, &too_short);
        assert_eq!(model.process(&frame, 3), Verdict::Drop);

        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 3);
        model.assert_counter_identity();
    }

    #[test]
    fn empty_bedrock_payload_drops() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &[]);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 1);
    }

    #[test]
    fn short_magic_drops() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        // Unconnected ping with only 15 of the 16 magic bytes.
        let payload = raknet_raw(0x05, &obsidianprotection_ebpf::RAKNET_MAGIC[..15]);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &payload);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 1);
    }

    #[test]
    fn bedrock_challenge_flow() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        // Invalid first byte.
        let bogus = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &[0x01, 0x02]);
        assert_eq!(model.process(&bogus, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::DROPPED_BADPROTO), 1);

        // Valid ping at t=0: challenged and dropped.
        let ping = raknet_ping(0, 0xdead_beef);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.stat(stat::CHALLENGES_SENT), 1);
        assert_eq!(model.stat(stat::DROPPED_CHALLENGE), 1);

        // Retransmit at t=200ms: accepted.
        assert_eq!(model.process(&frame, 200), Verdict::Redirect);
        assert_eq!(model.stat(stat::CHALLENGES_PASSED), 1);
        assert_eq!(model.stat(stat::ALLOWED), 1);
        assert_eq!(model.challenge_len(), 0);
        model.assert_counter_identity();
    }

    #[test]
    fn challenge_retransmit_too_fast_holds() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let ping = raknet_ping(0, 1);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);

        assert_eq!(model.process(&frame, 0), Verdict::Drop); // issue
        assert_eq!(model.process(&frame, 50), Verdict::Drop); // hold, < 100 ms
        assert_eq!(model.stat(stat::CHALLENGES_SENT), 1);
        assert_eq!(model.stat(stat::DROPPED_CHALLENGE), 2);

        assert_eq!(model.process(&frame, 150), Verdict::Redirect);
        model.assert_counter_identity();
    }

    #[test]
    fn expired_challenge_is_reissued() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let ping = raknet_ping(0, 1);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);

        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        // Beyond the 5 s window: fresh challenge rather than acceptance.
        assert_eq!(model.process(&frame, 6_000), Verdict::Drop);
        assert_eq!(model.stat(stat::CHALLENGES_SENT), 2);

        assert_eq!(model.process(&frame, 6_200), Verdict::Redirect);
    }

    #[test]
    fn challenged_source_is_not_rechallenged_inside_conntrack_window() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let ping = raknet_ping(0, 1);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);

        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.process(&frame, 200), Verdict::Redirect);

        // Subsequent valid traffic on the same flow inside the idle window.
        for t in [1_000u64, 5_000, 20_000] {
            assert_eq!(model.process(&frame, t), Verdict::Redirect);
        }
        assert_eq!(model.stat(stat::CHALLENGES_SENT), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn challenge_table_saturation_drops() {
        let mut model = ClassifierModel::new().with_challenge_capacity(1);
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let ping = raknet_ping(0, 1);
        let first = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);
        let second = udp_frame(
            Ipv4Addr::new(203, 0, 113, 78),
            FRONT_IP,
            50001,
            BEDROCK_PORT,
            &ping,
        );

        assert_eq!(model.process(&first, 0), Verdict::Drop);
        assert_eq!(model.process(&second, 10), Verdict::Drop);
        assert_eq!(model.stat(stat::SATURATION), 1);
        model.assert_counter_identity();
    }

    #[test]
    fn reaper_clears_idle_flows_per_kind() {
        let mut model = ClassifierModel::new();
        let (jkey, jinfo) = java_endpoint();
        let (bkey, binfo) = bedrock_endpoint();
        model.upsert_endpoint(jkey, jinfo).unwrap();
        model.upsert_endpoint(bkey, binfo).unwrap();

        assert_eq!(model.process(&handshake_frame(40000), 0), Verdict::Redirect);

        let ping = raknet_ping(0, 1);
        let bframe = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);
        assert_eq!(model.process(&bframe, 0), Verdict::Drop);
        assert_eq!(model.process(&bframe, 200), Verdict::Redirect);
        assert_eq!(model.conntrack_len(), 2);

        // 31 s idle: the Bedrock flow expires, the Java one survives.
        model.reap(31_000);
        assert_eq!(model.conntrack_len(), 1);

        // 121 s idle: the Java flow expires too.
        model.reap(121_000);
        assert_eq!(model.conntrack_len(), 0);
    }

    #[test]
    fn reaper_clears_stale_challenges() {
        let mut model = ClassifierModel::new();
        let (key, info) = bedrock_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        let ping = raknet_ping(0, 1);
        let frame = udp_frame(CLIENT_IP, FRONT_IP, 50000, BEDROCK_PORT, &ping);
        assert_eq!(model.process(&frame, 0), Verdict::Drop);
        assert_eq!(model.challenge_len(), 1);

        model.reap(6_000);
        assert_eq!(model.challenge_len(), 0);
    }

    #[test]
    fn endpoint_round_trip_restores_prior_state() {
        let mut model = ClassifierModel::new();
        let (key, info) = java_endpoint();

        assert_eq!(model.endpoint_count(), 0);
        model.upsert_endpoint(key, info).unwrap();
        assert!(model.remove_endpoint(&key));
        assert_eq!(model.endpoint_count(), 0);
        assert!(!model.remove_endpoint(&key));
    }

    #[test]
    fn blacklist_round_trip_restores_prior_state() {
        let mut model = ClassifierModel::new();
        let src = u32::from(CLIENT_IP);
        model.add_blacklist(src, 1000).unwrap();
        assert!(model.remove_blacklist(src));
        assert_eq!(model.blacklist_len(), 0);
    }

    #[test]
    fn double_update_equals_single() {
        let mut model = ClassifierModel::new();
        let (key, mut info) = java_endpoint();
        model.upsert_endpoint(key, info).unwrap();

        info.rate_limit = 42;
        model.upsert_endpoint(key, info).unwrap();
        model.upsert_endpoint(key, info).unwrap();
        assert_eq!(model.endpoint_count(), 1);
    }

    #[test]
    fn mixed_traffic_counter_identity() {
        let mut model = ClassifierModel::new();
        let (jkey, jinfo) = java_endpoint();
        let (bkey, binfo) = bedrock_endpoint();
        model.upsert_endpoint(jkey, jinfo).unwrap();
        model.upsert_endpoint(bkey, binfo).unwrap();
        model.add_blacklist(u32::from(Ipv4Addr::new(9, 9, 9, 9)), u64::MAX).unwrap();

        let ping = raknet_ping(0, 1);
        for i in 0..200u64 {
            let client = Ipv4Addr::new(203, 0, 113, (i % 40) as u8);
            match i % 5 {
                0 => {
                    let payload = java_handshake(760, "", JAVA_PORT, 2);
                    let f = tcp_frame(client, FRONT_IP, 41000 + i as u16, JAVA_PORT, TCP_PSH, &payload);
                    model.process(&f, i * 3);
                }
                1 => {
                    let f = udp_frame(client, FRONT_IP, 51000 + i as u16, BEDROCK_PORT, &ping);
                    model.process(&f, i * 3);
                }
                2 => {
                    let f = udp_frame(client, FRONT_IP, 51000, 9999, &ping);
                    model.process(&f, i * 3);
                }
                3 => {
                    let f = tcp_frame(
                        Ipv4Addr::new(9, 9, 9, 9),
                        FRONT_IP,
                        41000,
                        JAVA_PORT,
                        TCP_PSH,
                        &[],
                    );
                    model.process(&f, i * 3);
                }
                _ => {
                    let f = tcp_frame(client, FRONT_IP, 41000, JAVA_PORT, TCP_PSH, &[0xff; 4]);
                    model.process(&f, i * 3);
                }
            }
        }

        assert_eq!(model.stat(stat::TOTAL_PACKETS), 200);
        model.assert_counter_identity();
    }
}
