//! Deterministic, per-stream RNG (spec §5).
//!
//! Each named stream is seeded `seed + nodeId` so two streams never draw
//! from the same sequence, and a run is bit-for-bit reproducible given the
//! same `seed`.

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Which independent stream a draw belongs to. Spec §5 names MSF, eLLSF,
/// sporadic (application traffic), mobility and EB/DIO as the streams that
/// must be kept independent per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RngStream {
    Msf,
    Ellsf,
    Sporadic,
    Mobility,
    Broadcast,
    Topology,
    Channel,
}

/// Construct the RNG for `stream` on `node_id`, given the run-wide `seed`.
///
/// Streams are disambiguated by mixing a small per-stream constant into the
/// seed before adding `node_id`, so `(seed, node_id)` pairs across different
/// streams don't collide even though they share the additive form spec §5
/// specifies (`seed + nodeId`).
pub fn stream_rng(seed: u64, node_id: u32, stream: RngStream) -> StdRng {
    let stream_salt: u64 = match stream {
        RngStream::Msf => 0x9E3779B9_0000_0001,
        RngStream::Ellsf => 0x9E3779B9_0000_0002,
        RngStream::Sporadic => 0x9E3779B9_0000_0003,
        RngStream::Mobility => 0x9E3779B9_0000_0004,
        RngStream::Broadcast => 0x9E3779B9_0000_0005,
        RngStream::Topology => 0x9E3779B9_0000_0006,
        RngStream::Channel => 0x9E3779B9_0000_0007,
    };
    StdRng::seed_from_u64(seed.wrapping_add(stream_salt).wrapping_add(node_id as u64))
}

/// A channel draw is re-derived fresh every ASN rather than carried forward
/// as mutable per-pair state (spec §5's explicit-context design favors
/// stateless reconstruction over a `HashMap` of live generators). Folding the
/// ASN into the seed keeps draws independent across slots while keeping two
/// runs with the same seed bit-for-bit identical (spec §5).
pub fn channel_rng(seed: u64, a: u32, b: u32, asn: crate::time::Asn) -> StdRng {
    let pair = (a as u64) ^ ((b as u64) << 32) ^ (b as u64 >> 16);
    let asn_mix = asn.0.wrapping_mul(0x2545F4914F6CDD1D).rotate_left(17);
    StdRng::seed_from_u64(
        seed.wrapping_add(0x9E3779B9_0000_0007)
            .wrapping_add(pair)
            .wrapping_add(asn_mix),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn same_seed_same_node_is_deterministic() {
        let mut a = stream_rng(0, 3, RngStream::Msf);
        let mut b = stream_rng(0, 3, RngStream::Msf);
        let xa: u32 = a.gen();
        let xb: u32 = b.gen();
        assert_eq!(xa, xb);
    }

    #[test]
    fn distinct_streams_diverge() {
        let mut a = stream_rng(0, 3, RngStream::Msf);
        let mut b = stream_rng(0, 3, RngStream::Sporadic);
        let xa: u32 = a.gen();
        let xb: u32 = b.gen();
        assert_ne!(xa, xb);
    }
}
