//! Minimal Scheduling Function: cell-usage accounting, 6top timeout
//! computation, DELETE candidate selection, and parent-change choreography
//! (spec §4.6).

use crate::node::schedule::Cell;
use crate::packet::NodeId;

/// Cell-usage counters, advanced only on dedicated cells to the preferred
/// parent (spec §4.6).
#[derive(Debug, Default, Clone, Copy)]
pub struct CellUsage {
    pub num_cells_elapsed: u32,
    pub num_cells_used: u32,
}

impl CellUsage {
    /// Called on every activation of a dedicated cell to the preferred
    /// parent; `success` marks whether a frame was actually exchanged.
    pub fn on_activation(&mut self, success: bool, max_num_cells: u32) {
        self.num_cells_elapsed += 1;
        if success {
            self.num_cells_used += 1;
        }
        if self.num_cells_elapsed >= max_num_cells {
            self.num_cells_elapsed = 0;
            self.num_cells_used = 0;
        }
    }
}

/// MSF-level parent-change state machine driving repeated ADD/DELETE
/// attempts after a preferred-parent switch (spec §4.6).
#[derive(Debug, Default)]
pub struct ParentChangeState {
    pub old_parent: Option<NodeId>,
    pub attempts_left: u8,
}

/// `timeout = ceil((slotframeLength*slotDuration / txCells) * (1/meanPDR) * factor)`,
/// falling back to `MSF_DEFAULT_SIXTOP_TIMEOUT` if there are no cells or
/// zero mean PDR (spec §4.4).
pub fn compute_sixtop_timeout(
    slotframe_length: u16,
    slot_duration: f64,
    tx_cells_to_peer: u32,
    mean_cell_pdr: f32,
    factor: f64,
    default_timeout: u16,
) -> u16 {
    if tx_cells_to_peer == 0 || mean_cell_pdr <= 0.0 {
        return default_timeout;
    }
    let cycle_duration = slotframe_length as f64 * slot_duration;
    let timeout_seconds = (cycle_duration / tx_cells_to_peer as f64) * (1.0 / mean_cell_pdr as f64) * factor;
    let asn_span = (timeout_seconds / slot_duration).ceil();
    asn_span.max(1.0) as u16
}

/// DELETE candidate selection (spec §4.4): uniform random if
/// `sixtop_remove_random_cell`, else group by observed-vs-theoretical PDR
/// and prefer the worst (below-theoretical, highest `numTx`) performer(s).
pub fn select_delete_candidates<'a>(
    cells: &'a [&'a Cell],
    num_to_remove: u8,
    theoretical_pdr: f32,
    remove_random: bool,
    mut rng: impl rand::Rng,
) -> Vec<u16> {
    use rand::seq::SliceRandom;
    let n = num_to_remove as usize;
    if remove_random {
        let mut ts: Vec<u16> = cells.iter().map(|c| c.timeslot).collect();
        ts.shuffle(&mut rng);
        ts.truncate(n);
        return ts;
    }

    let mut below: Vec<&Cell> = Vec::new();
    let mut at_or_above: Vec<&Cell> = Vec::new();
    for &c in cells {
        match c.observed_pdr() {
            Some(pdr) if pdr < theoretical_pdr => below.push(c),
            _ => at_or_above.push(c),
        }
    }
    below.sort_by(|a, b| b.num_tx.cmp(&a.num_tx));
    at_or_above.sort_by(|a, b| b.num_tx.cmp(&a.num_tx));

    below
        .into_iter()
        .chain(at_or_above)
        .take(n)
        .map(|c| c.timeslot)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::schedule::{CellDirection, Schedule};
    use crate::packet::Peer;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn cell_usage_resets_after_elapsed_reaches_max() {
        let mut usage = CellUsage::default();
        usage.on_activation(true, 2);
        usage.on_activation(true, 2);
        assert_eq!(usage.num_cells_elapsed, 0);
        assert_eq!(usage.num_cells_used, 0);
    }

    #[test]
    fn timeout_falls_back_to_default_with_no_cells() {
        let t = compute_sixtop_timeout(101, 0.01, 0, 0.0, 1.0, 100);
        assert_eq!(t, 100);
    }

    #[test]
    fn timeout_scales_with_cells_and_pdr() {
        let t = compute_sixtop_timeout(101, 0.01, 1, 1.0, 1.0, 100);
        assert!(t > 0);
    }

    #[test]
    fn delete_prefers_worst_below_theoretical_cell() {
        let mut s = Schedule::new();
        s.add_cell(1, 1, 0, CellDirection::Tx, Peer::Unicast(9), 0).unwrap();
        s.add_cell(1, 2, 0, CellDirection::Tx, Peer::Unicast(9), 0).unwrap();
        {
            let c1 = s.get_mut(1).unwrap();
            c1.num_tx = 20;
            c1.num_tx_ack = 5; // pdr 0.25, below theoretical
        }
        {
            let c2 = s.get_mut(2).unwrap();
            c2.num_tx = 20;
            c2.num_tx_ack = 19; // pdr 0.95, at/above theoretical
        }
        let cells: Vec<&Cell> = s.iter().collect();
        let rng = StdRng::seed_from_u64(0);
        let picked = select_delete_candidates(&cells, 1, 0.9, false, rng);
        assert_eq!(picked, vec![1]);
    }
}
