//! eBPF program management: object loading, XDP attachment and the map
//! synchronizer that owns control-plane writes into the shared kernel maps.

pub mod loader;
pub mod sync;

/// Milliseconds on the monotonic clock, matching `bpf_ktime_get_ns` in the
/// kernel program. Wall-clock time must never be mixed into map timestamps.
pub fn monotonic_ms() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("CLOCK_MONOTONIC is always available");
    ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000
}
