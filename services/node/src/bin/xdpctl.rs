//! Loader and map management CLI for the XDP filter object.
//!
//! `load` attaches the program and pins its maps under the bpf filesystem;
//! the remaining commands operate on the pinned maps so they work from a
//! separate process. Errors go to stderr and the exit code is non-zero on
//! any failure.

use anyhow::{bail, Context, Result};
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{HashMap as KernelHashMap, Map, MapData, PerCpuArray};
use aya::programs::{links::FdLink, Xdp, XdpFlags};
use aya::Ebpf;
use clap::{Parser, Subcommand};
use obsidianprotection_ebpf::{
    map_names, stat, EndpointInfo, EndpointKey, ENDPOINT_KEY_BITS, IPPROTO_TCP, IPPROTO_UDP,
    KIND_BEDROCK, KIND_JAVA, PROGRAM_NAME,
};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

const PIN_DIR: &str = "/sys/fs/bpf/obsidianprotection";

#[derive(Parser)]
#[command(name = "xdpctl", about = "Manage the ObsidianProtection XDP filter", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the filter object, attach it to an interface and pin its maps.
    Load { iface: String, obj: PathBuf },
    /// Insert or replace a protected endpoint.
    AddEndpoint {
        front_ip: Ipv4Addr,
        front_port: u16,
        l4: String,
        origin_ip: Ipv4Addr,
        origin_port: u16,
        kind: String,
        rate: u32,
        burst: u32,
    },
    /// Remove a protected endpoint by its front tuple.
    RemoveEndpoint {
        front_ip: Ipv4Addr,
        front_port: u16,
        l4: String,
    },
    /// Blacklist a source address for a number of milliseconds.
    Blacklist { ip: Ipv4Addr, ttl_ms: u64 },
    /// Remove a source address from the blacklist.
    Unblacklist { ip: Ipv4Addr },
    /// Print the fast-path counters.
    Stats,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("xdpctl: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Load { iface, obj } => load(&iface, &obj),
        Command::AddEndpoint {
            front_ip,
            front_port,
            l4,
            origin_ip,
            origin_port,
            kind,
            rate,
            burst,
        } => add_endpoint(
            front_ip, front_port, &l4, origin_ip, origin_port, &kind, rate, burst,
        ),
        Command::RemoveEndpoint {
            front_ip,
            front_port,
            l4,
        } => remove_endpoint(front_ip, front_port, &l4),
        Command::Blacklist { ip, ttl_ms } => blacklist(ip, ttl_ms),
        Command::Unblacklist { ip } => unblacklist(ip),
        Command::Stats => stats(),
    }
}

fn parse_l4(l4: &str) -> Result<u8> {
    match l4 {
        "tcp" => Ok(IPPROTO_TCP),
        "udp" => Ok(IPPROTO_UDP),
        other => bail!("unknown L4 protocol {other:?}, expected tcp or udp"),
    }
}

fn parse_kind(kind: &str) -> Result<u8> {
    match kind {
        "java" => Ok(KIND_JAVA),
        "bedrock" => Ok(KIND_BEDROCK),
        other => bail!("unknown kind {other:?}, expected java or bedrock"),
    }
}

fn load(iface: &str, obj: &Path) -> Result<()> {
    let data = std::fs::read(obj).with_context(|| format!("reading {}", obj.display()))?;
    let mut ebpf = Ebpf::load(&data).context("loading eBPF object")?;

    std::fs::create_dir_all(PIN_DIR).with_context(|| format!("creating {PIN_DIR}"))?;

    for name in [
        map_names::PROTECTED_ENDPOINTS,
        map_names::SRC_RATE,
        map_names::CONNTRACK,
        map_names::BLACKLIST,
        map_names::STATS,
        map_names::UDP_CHALLENGES,
    ] {
        let map = ebpf
            .map_mut(name)
            .with_context(|| format!("map {name} missing from object"))?;
        map.pin(format!("{PIN_DIR}/{name}"))
            .with_context(|| format!("pinning {name}"))?;
    }

    let program: &mut Xdp = ebpf
        .program_mut(PROGRAM_NAME)
        .context("program missing from object")?
        .try_into()
        .context("not an XDP program")?;
    program.load().context("loading XDP program")?;

    let link_id = match program.attach(iface, XdpFlags::DRV_MODE) {
        Ok(link_id) => link_id,
        Err(_) => program
            .attach(iface, XdpFlags::SKB_MODE)
            .with_context(|| format!("attaching to {iface}"))?,
    };

    // Pin the link so the attachment outlives this process.
    let link = program.take_link(link_id).context("taking XDP link")?;
    let fd_link: FdLink = link.try_into().context("converting XDP link")?;
    fd_link
        .pin(format!("{PIN_DIR}/{PROGRAM_NAME}_link"))
        .context("pinning XDP link")?;

    println!("attached {PROGRAM_NAME} to {iface}, maps pinned under {PIN_DIR}");
    Ok(())
}

fn open_map(name: &str) -> Result<MapData> {
    MapData::from_pin(format!("{PIN_DIR}/{name}"))
        .with_context(|| format!("opening pinned map {name} (did you run `xdpctl load`?)"))
}

fn monotonic_ms() -> Result<u64> {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .context("reading CLOCK_MONOTONIC")?;
    Ok(ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000)
}

#[allow(clippy::too_many_arguments)]
fn add_endpoint(
    front_ip: Ipv4Addr,
    front_port: u16,
    l4: &str,
    origin_ip: Ipv4Addr,
    origin_port: u16,
    kind: &str,
    rate: u32,
    burst: u32,
) -> Result<()> {
    let protocol = parse_l4(l4)?;
    let kind = parse_kind(kind)?;

    // The kind pins the transport.
    let expected = if kind == KIND_JAVA { IPPROTO_TCP } else { IPPROTO_UDP };
    if protocol != expected {
        bail!("kind/protocol mismatch: java requires tcp, bedrock requires udp");
    }
    if rate < 1 || burst < rate {
        bail!("invalid policy: require burst >= rate >= 1");
    }

    let mut trie: LpmTrie<_, EndpointKey, EndpointInfo> =
        LpmTrie::try_from(Map::LpmTrie(open_map(map_names::PROTECTED_ENDPOINTS)?))
            .context("endpoint map type")?;

    let key = EndpointKey::new(u32::from(front_ip), front_port, protocol);
    let info = EndpointInfo {
        origin_ip: u32::from(origin_ip),
        origin_port,
        kind,
        maintenance: 0,
        rate_limit: rate,
        burst_limit: burst,
    };
    trie.insert(&Key::new(ENDPOINT_KEY_BITS, key), info, 0)
        .context("inserting endpoint")?;

    println!("endpoint {front_ip}:{front_port}/{l4} -> {origin_ip}:{origin_port} added");
    Ok(())
}

fn remove_endpoint(front_ip: Ipv4Addr, front_port: u16, l4: &str) -> Result<()> {
    let protocol = parse_l4(l4)?;
    let mut trie: LpmTrie<_, EndpointKey, EndpointInfo> =
        LpmTrie::try_from(Map::LpmTrie(open_map(map_names::PROTECTED_ENDPOINTS)?))
            .context("endpoint map type")?;

    let key = EndpointKey::new(u32::from(front_ip), front_port, protocol);
    trie.remove(&Key::new(ENDPOINT_KEY_BITS, key))
        .context("removing endpoint")?;

    println!("endpoint {front_ip}:{front_port}/{l4} removed");
    Ok(())
}

fn blacklist(ip: Ipv4Addr, ttl_ms: u64) -> Result<()> {
    let mut map: KernelHashMap<_, u32, u64> =
        KernelHashMap::try_from(Map::HashMap(open_map(map_names::BLACKLIST)?))
            .context("blacklist map type")?;

    let blocked_until = monotonic_ms()?.saturating_add(ttl_ms);
    map.insert(u32::from(ip), blocked_until, 0)
        .context("inserting blacklist entry")?;

    println!("{ip} blacklisted for {ttl_ms} ms");
    Ok(())
}

fn unblacklist(ip: Ipv4Addr) -> Result<()> {
    let mut map: KernelHashMap<_, u32, u64> =
        KernelHashMap::try_from(Map::HashMap(open_map(map_names::BLACKLIST)?))
            .context("blacklist map type")?;

    map.remove(&u32::from(ip)).context("removing blacklist entry")?;
    println!("{ip} removed from blacklist");
    Ok(())
}

fn stats() -> Result<()> {
    let array: PerCpuArray<_, u64> =
        PerCpuArray::try_from(Map::PerCpuArray(open_map(map_names::STATS)?))
            .context("stats map type")?;

    let names = [
        (stat::TOTAL_PACKETS, "total_packets"),
        (stat::ALLOWED, "allowed"),
        (stat::DROPPED_RATELIMIT, "dropped_ratelimit"),
        (stat::DROPPED_BLACKLIST, "dropped_blacklist"),
        (stat::DROPPED_BADPROTO, "dropped_badproto"),
        (stat::DROPPED_CHALLENGE, "dropped_challenge"),
        (stat::DROPPED_MAINTENANCE, "dropped_maintenance"),
        (stat::PASS, "pass"),
        (stat::REDIRECT, "redirect"),
        (stat::CHALLENGES_SENT, "challenges_sent"),
        (stat::CHALLENGES_PASSED, "challenges_passed"),
        (stat::SATURATION, "saturation"),
    ];

    for (slot, name) in names {
        let total: u64 = array
            .get(&slot, 0)
            .with_context(|| format!("reading counter {name}"))?
            .iter()
            .sum();
        println!("{name:22} {total}");
    }
    Ok(())
}
