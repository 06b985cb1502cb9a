//! Topology collaborator: initial placement, RSSI/PDR maps, per-link
//! modulation (spec §1, §6). Out of scope per spec §1; the trait plus this
//! log-distance reference implementation are grounded on the teacher's
//! `simulation/signal_calculations.rs` (`calculate_path_loss`,
//! `calculate_rssi`), generalized from LoRa airtime modeling to a plain
//! RSSI → PDR lookup used once per TSCH slot rather than per CAD window.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use crate::collaborators::modulation::Mcs;

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Assigns initial coordinates, populates per-pair RSSI/PDR, and assigns a
/// per-link modulation (spec §6).
pub trait Topology {
    fn place(&mut self, num_nodes: u32) -> Vec<Point>;
    fn rssi(&self, a: u32, b: u32) -> f32;
    fn rssi_to_pdr(&self, rssi: f32, mcs: Mcs) -> f32;
    fn pdr(&self, a: u32, b: u32, mcs: Mcs) -> f32 {
        self.rssi_to_pdr(self.rssi(a, b), mcs)
    }

    /// Effective PDR once concurrent same-channel interference is folded in
    /// (spec §4.2 step 2: "all other simultaneous transmissions on the same
    /// channel are interference; compute effective PDR using RSSI and
    /// modulation-specific SNR threshold"). `interferers_rssi` is every
    /// other transmitter's RSSI at this receiver, heard on the same
    /// channel during the same slot. Default: fold every interferer's
    /// linear power into a single SINR-style penalty against `rssi` and
    /// hand the result to `rssi_to_pdr` as if it were the (degraded)
    /// signal RSSI; an empty interferer list reduces to `rssi_to_pdr`
    /// exactly, so single-interferer-free slots are unaffected.
    fn rssi_to_pdr_with_interference(&self, rssi: f32, interferers_rssi: &[f32], mcs: Mcs) -> f32 {
        if interferers_rssi.is_empty() {
            return self.rssi_to_pdr(rssi, mcs);
        }
        let signal_lin = 10f32.powf(rssi / 10.0);
        let interference_lin: f32 = interferers_rssi.iter().map(|i| 10f32.powf(i / 10.0)).sum();
        let sinr_penalty_db = 10.0 * (1.0 + interference_lin / signal_lin.max(1e-12)).log10();
        self.rssi_to_pdr(rssi - sinr_penalty_db, mcs)
    }
}

/// Log-distance path loss with optional log-normal shadowing, the same
/// model as the teacher's `PathLossParameters`/`calculate_path_loss`.
///
/// `PL(d) = PL(d0) + 10 * n * log10(d / d0) + X_sigma`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogDistanceTopology {
    pub path_loss_exponent: f32,
    pub shadowing_sigma: f32,
    pub path_loss_at_reference_distance: f32,
    pub noise_floor: f32,
    pub tx_power_dbm: f32,
    /// SNR margin (dB) above `noise_floor` a receiver needs for MCS 0;
    /// higher MCS indices demand more margin, matching the teacher's
    /// per-modulation SNR threshold delegation (spec §4.2 step 2).
    pub snr_threshold_db: [f32; 3],
    pub square_side: f64,
    #[serde(skip)]
    positions: Vec<Point>,
    #[serde(skip)]
    seed: u64,
}

impl Default for LogDistanceTopology {
    fn default() -> Self {
        LogDistanceTopology {
            path_loss_exponent: 2.7,
            shadowing_sigma: 4.0,
            path_loss_at_reference_distance: 40.0,
            noise_floor: -110.0,
            tx_power_dbm: 14.0,
            snr_threshold_db: [-6.0, 0.0, 6.0],
            square_side: 200.0,
            positions: Vec::new(),
            seed: 0,
        }
    }
}

impl LogDistanceTopology {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn distance(&self, a: u32, b: u32) -> f64 {
        let pa = self.positions[a as usize];
        let pb = self.positions[b as usize];
        ((pa.x - pb.x).powi(2) + (pa.y - pb.y).powi(2)).sqrt()
    }

    fn path_loss(&self, distance: f64, rng: &mut impl Rng) -> f32 {
        if distance < 1.0 {
            return self.path_loss_at_reference_distance;
        }
        let base =
            self.path_loss_at_reference_distance + 10.0 * self.path_loss_exponent * (distance as f32).log10();
        let shadow = if self.shadowing_sigma > 0.0 {
            Normal::new(0.0_f32, self.shadowing_sigma)
                .expect("finite shadowing sigma")
                .sample(rng)
        } else {
            0.0
        };
        base + shadow
    }
}

impl Topology for LogDistanceTopology {
    fn place(&mut self, num_nodes: u32) -> Vec<Point> {
        let mut rng = crate::rng::stream_rng(self.seed, 0, crate::rng::RngStream::Topology);
        self.positions = (0..num_nodes)
            .map(|_| Point {
                x: rng.gen_range(0.0..self.square_side),
                y: rng.gen_range(0.0..self.square_side),
            })
            .collect();
        self.positions.clone()
    }

    fn rssi(&self, a: u32, b: u32) -> f32 {
        let mut rng = crate::rng::stream_rng(self.seed, a ^ b, crate::rng::RngStream::Channel);
        let d = self.distance(a, b);
        self.tx_power_dbm - self.path_loss(d, &mut rng)
    }

    fn rssi_to_pdr(&self, rssi: f32, mcs: Mcs) -> f32 {
        let threshold = self.snr_threshold_db[(mcs as usize).min(2)];
        let snr = rssi - self.noise_floor;
        let margin = snr - threshold;
        // Logistic roll-off around the SNR threshold: well above threshold
        // saturates to ~1.0, well below to ~0.0.
        let pdr = 1.0 / (1.0 + (-margin / 2.0).exp());
        pdr.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_nodes_have_better_pdr() {
        let mut topo = LogDistanceTopology::default().with_seed(0);
        topo.place(3);
        let near_rssi = topo.rssi(0, 1);
        let near_pdr = topo.rssi_to_pdr(near_rssi, 0);
        // A much weaker synthetic RSSI should yield a lower PDR.
        let far_pdr = topo.rssi_to_pdr(near_rssi - 40.0, 0);
        assert!(far_pdr <= near_pdr);
    }

    #[test]
    fn pdr_is_bounded() {
        let topo = LogDistanceTopology::default();
        assert!(topo.rssi_to_pdr(1000.0, 0) <= 1.0);
        assert!(topo.rssi_to_pdr(-1000.0, 0) >= 0.0);
    }

    #[test]
    fn no_interferers_matches_plain_pdr() {
        let topo = LogDistanceTopology::default();
        assert_eq!(topo.rssi_to_pdr_with_interference(-60.0, &[], 0), topo.rssi_to_pdr(-60.0, 0));
    }

    #[test]
    fn a_strong_interferer_degrades_pdr() {
        let topo = LogDistanceTopology::default();
        let clean = topo.rssi_to_pdr_with_interference(-60.0, &[], 0);
        let interfered = topo.rssi_to_pdr_with_interference(-60.0, &[-60.0], 0);
        assert!(interfered < clean);
    }

    #[test]
    fn interference_aware_pdr_stays_bounded() {
        let topo = LogDistanceTopology::default();
        let pdr = topo.rssi_to_pdr_with_interference(-40.0, &[-90.0, -90.0, -90.0], 0);
        assert!((0.0..=1.0).contains(&pdr));
    }
}
