//! 6top reliable request/response sublayer (spec §3, §4.4).
//!
//! One transaction pair (`tx`, `rx`) per neighbor. The sequence number is
//! incremented only on a successful response ACK. Blocked cells are a
//! transient reservation: timeslots proposed in an outstanding request that
//! must not be handed out by any other concurrent transaction (spec §4.4's
//! "any transaction that consults available cells must exclude the union
//! of all neighbors' blocked sets").

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::engine::scheduler::EventTag;
use crate::packet::{CellSpec, NodeId, SixpOp, SixpReturnCode};

/// Initiator-side transaction state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    SendingRequest,
    WaitRequestSendDone,
    WaitResponse,
}

/// Responder-side transaction state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    RequestReceived,
    WaitResponseSendDone,
}

#[derive(Debug, Clone, Default)]
pub struct TxHalf {
    pub state: Option<TxState>,
    pub seq: u8,
    pub op: Option<SixpOp>,
    pub blocked: Vec<CellSpec>,
    pub timeout_tag: Option<EventTag>,
}

impl TxHalf {
    fn is_idle(&self) -> bool {
        self.state.is_none_or_idle()
    }
}

trait StateIdle {
    fn is_none_or_idle(&self) -> bool;
}
impl StateIdle for Option<TxState> {
    fn is_none_or_idle(&self) -> bool {
        matches!(self, None | Some(TxState::Idle))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RxHalf {
    pub state: Option<RxState>,
    pub seq: u8,
    pub op: Option<SixpOp>,
    pub blocked: Vec<CellSpec>,
}

impl RxHalf {
    fn is_idle(&self) -> bool {
        matches!(self.state, None | Some(RxState::Idle))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeighborSixtop {
    pub tx: TxHalf,
    pub rx: RxHalf,
}

/// Owns the per-neighbor transaction pairs for one node, plus the node-wide
/// blocked-cells reservation (spec §4.4).
#[derive(Debug, Default)]
pub struct SixtopState {
    pub neighbors: HashMap<NodeId, NeighborSixtop>,
}

impl SixtopState {
    pub fn new() -> Self {
        SixtopState { neighbors: HashMap::new() }
    }

    pub fn neighbor(&mut self, id: NodeId) -> &mut NeighborSixtop {
        self.neighbors.entry(id).or_default()
    }

    /// All timeslots currently reserved (not yet installed) across every
    /// neighbor's in-flight transaction (spec §4.4).
    pub fn all_blocked_timeslots(&self) -> HashSet<u16> {
        self.neighbors
            .values()
            .flat_map(|n| n.tx.blocked.iter().chain(n.rx.blocked.iter()))
            .map(|c| c.timeslot)
            .collect()
    }

    pub fn tx_is_idle(&self, neighbor: NodeId) -> bool {
        self.neighbors.get(&neighbor).map(|n| n.tx.is_idle()).unwrap_or(true)
    }

    pub fn rx_is_idle(&self, neighbor: NodeId) -> bool {
        self.neighbors.get(&neighbor).map(|n| n.rx.is_idle()).unwrap_or(true)
    }

    /// Abort the initiator side, freeing blocked cells and returning to
    /// IDLE without advancing the sequence number (spec §4.4, §7).
    pub fn abort_tx(&mut self, neighbor: NodeId) -> Vec<CellSpec> {
        let n = self.neighbor(neighbor);
        n.tx.state = Some(TxState::Idle);
        n.tx.op = None;
        n.tx.timeout_tag = None;
        std::mem::take(&mut n.tx.blocked)
    }

    pub fn abort_rx(&mut self, neighbor: NodeId) -> Vec<CellSpec> {
        let n = self.neighbor(neighbor);
        n.rx.state = Some(RxState::Idle);
        n.rx.op = None;
        std::mem::take(&mut n.rx.blocked)
    }
}

/// Outcome of handling an incoming 6P request at the responder.
pub struct ResponderDecision {
    pub code: SixpReturnCode,
    pub granted: Vec<CellSpec>,
    /// Cells to reserve in `rx.blocked` until the response TX senddone.
    pub to_block: Vec<CellSpec>,
    /// Whether an already in-flight rx transaction was reset (spec §4.4:
    /// "purge any pending RESPONSE in the queue and respond RC_RESET").
    pub reset_prior: bool,
}

/// Build the responder's decision for an ADD-REQUEST (spec §4.4).
///
/// `is_free` tells whether a candidate cell (and, under multi-slot
/// modulation, its successor placeholders) is free in this node's own
/// schedule and not already blocked by one of its own in-flight
/// transactions; the caller is responsible for that span check.
pub fn decide_add_response(
    requested: &[CellSpec],
    num_cells: u8,
    is_free: impl Fn(&CellSpec) -> bool,
) -> ResponderDecision {
    let matches: Vec<CellSpec> = requested
        .iter()
        .filter(|c| is_free(c))
        .take(num_cells as usize)
        .copied()
        .collect();
    let code = if matches.is_empty() {
        SixpReturnCode::NoResources
    } else {
        SixpReturnCode::Success
    };
    ResponderDecision {
        code,
        to_block: matches.clone(),
        granted: matches,
        reset_prior: false,
    }
}

/// Policy for selecting candidate cells on ADD (spec §4.4 step 1).
///
/// `num_cells * factor` distinct free timeslots are proposed; in multi-slot
/// mode each candidate's `slots - 1` successors must also be free so the
/// whole span can be granted as one multi-slot cell.
pub fn select_add_candidates(
    num_cells: u8,
    factor: u8,
    slots_per_cell: u8,
    slotframe_length: u16,
    num_chans: u8,
    mcs: u8,
    is_free: impl Fn(u16) -> bool,
    mut rng: impl rand::Rng,
) -> Vec<CellSpec> {
    use rand::seq::SliceRandom;
    let want = (num_cells as u32 * factor as u32).max(1) as usize;
    let mut candidates: Vec<u16> = (0..slotframe_length)
        .filter(|&ts| {
            is_free(ts)
                && (0..slots_per_cell).all(|o| {
                    let t = ts + o as u16;
                    t < slotframe_length && is_free(t)
                })
        })
        .collect();
    candidates.shuffle(&mut rng);
    candidates.truncate(want);
    candidates
        .into_iter()
        .map(|ts| CellSpec {
            timeslot: ts,
            channel: rng.gen_range(0..num_chans.max(1)),
            mcs,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn responder_grants_up_to_num_cells() {
        let requested = vec![
            CellSpec { timeslot: 1, channel: 0, mcs: 0 },
            CellSpec { timeslot: 2, channel: 0, mcs: 0 },
            CellSpec { timeslot: 3, channel: 0, mcs: 0 },
        ];
        let mut free = HashSet::new();
        free.insert(1);
        free.insert(2);
        free.insert(3);
        let decision = decide_add_response(&requested, 2, |c| free.contains(&c.timeslot));
        assert_eq!(decision.granted.len(), 2);
        assert_eq!(decision.code, SixpReturnCode::Success);
    }

    #[test]
    fn responder_rejects_with_no_resources_when_none_available() {
        let requested = vec![CellSpec { timeslot: 1, channel: 0, mcs: 0 }];
        let free = HashSet::new();
        let decision = decide_add_response(&requested, 1, |c| free.contains(&c.timeslot));
        assert_eq!(decision.code, SixpReturnCode::NoResources);
        assert!(decision.granted.is_empty());
    }

    #[test]
    fn responder_rejects_candidate_whose_multi_slot_span_is_not_free() {
        let requested = vec![CellSpec { timeslot: 1, channel: 0, mcs: 7 }];
        let mut free = HashSet::new();
        free.insert(1);
        // timeslot 2, the second slot of a two-slot span at mcs 7, is taken.
        let slots_for = |mcs: u8| if mcs == 7 { 2u8 } else { 1u8 };
        let decision = decide_add_response(&requested, 1, |c| {
            (0..slots_for(c.mcs)).all(|o| free.contains(&(c.timeslot + o as u16)))
        });
        assert_eq!(decision.code, SixpReturnCode::NoResources);
    }

    #[test]
    fn candidate_selection_respects_over_provisioning_factor() {
        let rng = StdRng::seed_from_u64(0);
        let candidates = select_add_candidates(1, 5, 1, 101, 16, 0, |_| true, rng);
        assert_eq!(candidates.len(), 5);
    }

    #[test]
    fn all_blocked_timeslots_spans_neighbors() {
        let mut s = SixtopState::new();
        s.neighbor(2).tx.blocked = vec![CellSpec { timeslot: 5, channel: 0, mcs: 0 }];
        s.neighbor(3).rx.blocked = vec![CellSpec { timeslot: 9, channel: 1, mcs: 0 }];
        let blocked = s.all_blocked_timeslots();
        assert!(blocked.contains(&5));
        assert!(blocked.contains(&9));
    }
}
