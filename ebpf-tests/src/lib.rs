//! Host-side test harness for the XDP fast path.
//!
//! `packet_generator` builds raw Ethernet/IPv4/TCP/UDP frames with Minecraft
//! payloads; `classifier` runs the same decision pipeline as the kernel
//! program over in-memory tables so the filter's contract can be verified
//! without loading an eBPF object.

pub mod classifier;
pub mod packet_generator;
