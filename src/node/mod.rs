//! The Mote container: owns one node's entire protocol state (spec §2, §3,
//! §9's "arena of nodes keyed by id; cross-node pointers are ids").
//!
//! A `Node` never reaches into another node directly — cross-node facts it
//! needs (a neighbor's advertised rank, whether accepting a candidate
//! parent would create a loop) are supplied by the caller (the engine) as
//! plain arguments, computed from a cheap snapshot of the arena. This keeps
//! `Node`'s methods free of arena borrows entirely.

pub mod app;
pub mod backoff;
pub mod energy;
pub mod join;
pub mod msf;
pub mod queue;
pub mod rpl;
pub mod schedule;
pub mod sixtop;

use std::collections::HashMap;

use rand::Rng;

use crate::collaborators::modulation::Mcs;
use crate::config::Config;
use crate::engine::scheduler::EventTag;
use crate::error::DropReason;
use crate::packet::{
    CellSpec, DataPayload, DioPayload, FramePayload, NodeId, Packet, Peer, SixpOp, SixpRequestPayload,
    SixpResponsePayload, SixpReturnCode,
};
use crate::time::Asn;

use self::app::FragmentationState;
use self::backoff::Backoff;
use self::energy::EnergyCounters;
use self::join::JoinState;
use self::msf::{CellUsage, ParentChangeState};
use self::queue::TxQueue;
use self::rpl::RplState;
use self::schedule::{Cell, CellDirection, Schedule};
use self::sixtop::SixtopState;

/// Link-quality and per-neighbor operating state (spec §3).
#[derive(Debug, Clone)]
pub struct NeighborLink {
    pub rssi: f32,
    pub static_pdr: f32,
    pub modulation: Mcs,
    pub backoff: Backoff,
}

impl NeighborLink {
    fn new(rssi: f32, static_pdr: f32, modulation: Mcs, min_exp: u8, max_exp: u8) -> Self {
        NeighborLink {
            rssi,
            static_pdr,
            modulation,
            backoff: Backoff::new(min_exp, max_exp),
        }
    }
}

/// Per-node MSF bookkeeping: cell-usage counters per neighbor plus the
/// in-flight parent-change choreography (spec §4.6).
#[derive(Debug, Default)]
pub struct MsfNodeState {
    pub usage_to_preferred_parent: CellUsage,
    pub parent_change: Option<ParentChangeState>,
    pub parent_change_tag: Option<EventTag>,
    pub housekeeping_tag: Option<EventTag>,
}

/// In-flight state for a unicast TX cell spanning more than one slot. The
/// frame was already dequeued at the parent slot, so each later
/// constituent slot must resume transmitting the same packet rather than
/// dequeue again, and the frame's final ACK/NACK is the AND of every
/// constituent slot's outcome (spec §4.2 step 4: "accumulate interference
/// across all constituent slots; any interfering slot marks the frame as
/// failed").
#[derive(Debug, Clone)]
pub struct PendingMultiSlotTx {
    pub parent_ts: u16,
    pub channel: u8,
    pub mcs: Mcs,
    pub packet: Packet,
    pub slots_done: u8,
    pub total_slots: u8,
    pub ok_so_far: bool,
}

/// An instruction for the engine to carry out on this node's behalf: send
/// a frame, (re)schedule a future callback, cancel one, or record a named
/// drop. Keeping this as data (rather than calling back into the arena
/// directly) is what lets `Node` stay arena-free (spec §9).
pub enum Effect {
    /// Enqueue `packet` onto this node's own TX queue.
    Enqueue(Packet),
    Schedule {
        delay: u64,
        priority: u8,
        tag: Option<EventTag>,
        event: SelfEvent,
    },
    Cancel(EventTag),
    Dropped(DropReason),
    Delivered { hop_count: u16, latency_slots: u64 },
}

/// Identifies what a future self-scheduled callback should do when it
/// fires (spec §4.1's named callbacks: `sendEB`, `sendDIO`, `sendDAO`,
/// `sixtop timeout`, `msf_parent_change`, `activeCell`).
#[derive(Debug, Clone, Copy)]
pub enum SelfEvent {
    SendEb,
    SendDio,
    SendDao,
    AppGenerate,
    JoinRetry,
    MsfHousekeeping,
    MsfParentChangeTick,
    SixtopTimeout { neighbor: NodeId, op: SixpOp },
}

pub struct Node {
    pub id: NodeId,
    pub is_root: bool,
    pub synced: bool,
    pub join: JoinState,
    pub rpl: RplState,
    pub neighbors: HashMap<NodeId, NeighborLink>,
    pub broadcast_backoff: Backoff,
    pub queue: TxQueue,
    pub schedule: Schedule,
    pub sixtop: SixtopState,
    pub msf: MsfNodeState,
    pub energy: EnergyCounters,
    pub frag: FragmentationState,
    pub drop_counts: HashMap<&'static str, u32>,
    pub packets_generated: u32,
    pub packets_delivered: u32,
    /// Set while a multi-slot unicast TX cell is mid-span (spec §4.2 step 4,
    /// §4.3).
    pub pending_tx: Option<PendingMultiSlotTx>,
}

impl Node {
    pub fn new(id: NodeId, is_root: bool, cfg: &Config) -> Self {
        Node {
            id,
            is_root,
            synced: is_root,
            join: if is_root { JoinState::root() } else { JoinState::default() },
            rpl: if is_root { RplState::new_root() } else { RplState::new_node() },
            neighbors: HashMap::new(),
            broadcast_backoff: Backoff::new(cfg.backoff_min_exp, cfg.backoff_max_exp),
            queue: TxQueue::new(),
            schedule: Schedule::new(),
            sixtop: SixtopState::new(),
            msf: MsfNodeState::default(),
            energy: EnergyCounters::default(),
            frag: FragmentationState::new(),
            drop_counts: HashMap::new(),
            packets_generated: 0,
            packets_delivered: 0,
            pending_tx: None,
        }
    }

    pub fn set_neighbor(&mut self, id: NodeId, rssi: f32, pdr: f32, modulation: Mcs, cfg: &Config) {
        self.neighbors
            .entry(id)
            .or_insert_with(|| NeighborLink::new(rssi, pdr, modulation, cfg.backoff_min_exp, cfg.backoff_max_exp));
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.drop_counts.entry(reason.counter_name()).or_insert(0) += 1;
    }

    /// Install the bootstrap minimal shared cells on channels `0..n`
    /// (spec §3: "installed during bootstrap and are never removed").
    pub fn install_minimal_cells(&mut self, nr_minimal_cells: u8, minimal_mcs: Mcs) {
        for ch in 0..nr_minimal_cells {
            // Minimal cells live at fixed low timeslots; callers ensure
            // `nr_minimal_cells <= slotframeLength`.
            let _ = self
                .schedule
                .add_cell(self.id, ch as u16, ch, CellDirection::Shared, Peer::Broadcast, minimal_mcs);
        }
    }

    /// Rank increase to `neighbor`, using observed ETX once sufficient
    /// samples exist, falling back to the static link PDR (spec §4.5).
    pub fn rank_increase_to(&self, neighbor: NodeId) -> u32 {
        let (num_tx, num_tx_ack) = self
            .schedule
            .cells_to_peer(neighbor, None)
            .iter()
            .filter_map(|&ts| self.schedule.get(ts))
            .fold((0u32, 0u32), |(tx, ack), c| (tx + c.num_tx, ack + c.num_tx_ack));
        let static_pdr = self.neighbors.get(&neighbor).map(|n| n.static_pdr).unwrap_or(0.0);
        let etx = rpl::estimate_etx(num_tx, num_tx_ack, static_pdr);
        rpl::rank_increase(etx)
    }

    /// Mean observed PDR across this node's dedicated TX cells to
    /// `neighbor`, falling back to the static link PDR when no cell has
    /// any samples yet (used for the 6top timeout computation, spec §4.4).
    pub fn mean_cell_pdr_to(&self, neighbor: NodeId) -> f32 {
        let cells: Vec<&Cell> = self
            .schedule
            .cells_to_peer(neighbor, Some(CellDirection::Tx))
            .iter()
            .filter_map(|&ts| self.schedule.get(ts))
            .collect();
        let observed: Vec<f32> = cells.iter().filter_map(|c| c.observed_pdr()).collect();
        if observed.is_empty() {
            self.neighbors.get(&neighbor).map(|n| n.static_pdr).unwrap_or(0.0)
        } else {
            observed.iter().sum::<f32>() / observed.len() as f32
        }
    }

    // ---------------------------------------------------------------
    // TSCH active-cell dispatch (spec §4.3)
    // ---------------------------------------------------------------

    /// What this node intends to do at the active cell for `asn`. `None`
    /// means the slot has no parent-slot cell for this node and no
    /// in-flight multi-slot continuation (sleep). `slots_for` resolves a
    /// cell's modulation to the number of consecutive timeslots its frame
    /// occupies (spec §4.3, §6).
    pub fn decide_active_cell(
        &mut self,
        asn: Asn,
        slotframe_length: u16,
        slots_for: impl Fn(Mcs) -> u8,
    ) -> Option<(u16, ActiveCellDecision)> {
        let offset = asn.slot_offset(slotframe_length);

        // Continuation of a multi-slot unicast TX begun at an earlier ASN:
        // resume transmitting the same frame rather than dequeue again.
        if let Some(pending) = &self.pending_tx {
            if pending.parent_ts.wrapping_add(pending.slots_done as u16) == offset {
                let parent_ts = pending.parent_ts;
                let channel = pending.channel;
                let mcs = pending.mcs;
                let packet = pending.packet.clone();
                let pending = self.pending_tx.as_mut().expect("checked Some above");
                pending.slots_done += 1;
                let is_final_slot = pending.slots_done >= pending.total_slots;
                return Some((
                    parent_ts,
                    ActiveCellDecision::Tx { channel, mcs, packet: Box::new(packet), is_final_slot },
                ));
            }
        }

        let cell = self.schedule.get(offset)?;
        if !cell.is_parent() {
            // Placeholder occupancy of a multi-slot cell. RX continuations
            // carry no extra state (the placeholder's own fields, copied
            // from the parent by `add_multi_slot_cell`, are enough); a TX
            // placeholder with no matching `pending_tx` means the in-flight
            // transmission was torn down mid-span, so there's nothing left
            // to send.
            return match cell.direction {
                CellDirection::Rx => Some((offset, ActiveCellDecision::Rx { channel: cell.channel })),
                _ => None,
            };
        }
        let direction = cell.direction;
        let channel = cell.channel;
        let peer = cell.peer;
        let mcs = cell.modulation;

        let decision = match direction {
            CellDirection::Rx => ActiveCellDecision::Rx { channel },
            CellDirection::Tx => match peer {
                Peer::Unicast(p) => match self.queue.take_for_next_hop(p) {
                    Some(pkt) => {
                        let span = slots_for(mcs).max(1);
                        if span > 1 {
                            self.pending_tx = Some(PendingMultiSlotTx {
                                parent_ts: offset,
                                channel,
                                mcs,
                                packet: pkt.clone(),
                                slots_done: 1,
                                total_slots: span,
                                ok_so_far: true,
                            });
                        }
                        ActiveCellDecision::Tx { channel, mcs, packet: Box::new(pkt), is_final_slot: span <= 1 }
                    }
                    None => ActiveCellDecision::IdleListen,
                },
                Peer::Broadcast => ActiveCellDecision::IdleListen,
            },
            // Shared cells only ever carry bootstrap/broadcast traffic at
            // the minimal-cell modulation, which is always single-slot
            // (spec §3, §4.6), so these never enter `pending_tx`.
            CellDirection::Shared => match peer {
                Peer::Broadcast => {
                    if !self.broadcast_backoff.ready() {
                        self.broadcast_backoff.tick();
                        ActiveCellDecision::IdleListen
                    } else {
                        let has_dedicated = |n: NodeId| !self.schedule.cells_to_peer(n, Some(CellDirection::Tx)).is_empty();
                        match self.queue.take_broadcast_eligible(has_dedicated) {
                            Some(pkt) => ActiveCellDecision::Tx { channel, mcs, packet: Box::new(pkt), is_final_slot: true },
                            None => ActiveCellDecision::IdleListen,
                        }
                    }
                }
                Peer::Unicast(p) => {
                    let ready = self.neighbors.get(&p).map(|n| n.backoff.ready()).unwrap_or(true);
                    if let Some(link) = self.neighbors.get_mut(&p) {
                        link.backoff.tick();
                    }
                    if !ready {
                        ActiveCellDecision::IdleListen
                    } else {
                        match self.queue.take_matching_peer(p) {
                            Some(pkt) => ActiveCellDecision::Tx { channel, mcs, packet: Box::new(pkt), is_final_slot: true },
                            None => ActiveCellDecision::IdleListen,
                        }
                    }
                }
            },
        };
        Some((offset, decision))
    }

    /// Fold one constituent slot's outcome into an in-flight multi-slot TX
    /// and return the frame's combined outcome once the final slot
    /// resolves (spec §4.2 step 4). For a single-slot transmission
    /// (`is_final_slot` is always true and no `pending_tx` exists for it)
    /// this degenerates to `Some(success_this_slot)`.
    pub fn note_multi_slot_tx_slot(&mut self, success_this_slot: bool, is_final_slot: bool) -> Option<bool> {
        let Some(pending) = self.pending_tx.as_mut() else {
            return Some(success_this_slot);
        };
        pending.ok_so_far &= success_this_slot;
        if !is_final_slot {
            return None;
        }
        let combined = pending.ok_so_far;
        self.pending_tx = None;
        Some(combined)
    }

    /// Called by the propagation coordinator once the slot's outcome is
    /// known for a TX this node performed (spec §4.2, §4.3).
    pub fn on_tx_outcome(&mut self, ts: u16, peer: Peer, acked: bool, is_broadcast: bool, msf_max_num_cells: u32) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.energy.charge_tx(true);
        if let Some(cell) = self.schedule.get_mut(ts) {
            cell.num_tx += 1;
            if acked {
                cell.num_tx_ack += 1;
            }
            cell.record(acked);
        }
        if self.rpl.preferred_parent == peer.node_id() {
            self.msf.usage_to_preferred_parent.on_activation(acked, msf_max_num_cells);
        }
        match peer {
            Peer::Broadcast => {
                if is_broadcast {
                    // broadcast frames are never ACKed; no retry (spec §4.2).
                }
            }
            Peer::Unicast(p) => {
                if acked {
                    if let Some(link) = self.neighbors.get_mut(&p) {
                        link.backoff.reset();
                    }
                } else if let Some(link) = self.neighbors.get_mut(&p) {
                    let mut rng = rand::thread_rng();
                    link.backoff.backoff_on_failure(&mut rng);
                }
            }
        }
        if self.queue.is_empty() {
            self.broadcast_backoff.reset();
        }
        effects
    }

    /// Retry/drop bookkeeping for a unicast frame that was not ACKed
    /// (spec §4.3: NACK/silence decrements `retriesLeft`; zero drops it).
    pub fn on_unicast_unacked(&mut self, mut pkt: Packet) -> Vec<Effect> {
        let mut effects = Vec::new();
        if pkt.retries_left == 0 {
            self.record_drop(DropReason::MacRetries);
            effects.push(Effect::Dropped(DropReason::MacRetries));
            self.on_permanent_drop(&pkt, &mut effects);
        } else {
            pkt.retries_left -= 1;
            self.queue.push_front(pkt);
        }
        effects
    }

    fn on_permanent_drop(&mut self, pkt: &Packet, _effects: &mut Vec<Effect>) {
        if let FramePayload::SixpRequest(req) = &pkt.payload {
            if let Peer::Unicast(neighbor) = pkt.destination {
                let freed = self.sixtop.abort_tx(neighbor);
                let _ = (req, freed);
            }
        }
        if let FramePayload::SixpResponse(_) = &pkt.payload {
            if let Peer::Unicast(neighbor) = pkt.destination {
                self.sixtop.abort_rx(neighbor);
            }
        }
    }

    // ---------------------------------------------------------------
    // 6top (spec §4.4)
    // ---------------------------------------------------------------

    /// Initiate an ADD transaction toward `neighbor` for `num_cells` cells.
    pub fn sixtop_initiate_add(
        &mut self,
        neighbor: NodeId,
        num_cells: u8,
        factor: u8,
        slots_per_cell: u8,
        slotframe_length: u16,
        num_chans: u8,
        mcs: u8,
        rng: impl Rng,
    ) -> Vec<Effect> {
        let own_taken: std::collections::HashSet<u16> = self.schedule.iter().map(|c| c.timeslot).collect();
        let blocked = self.sixtop.all_blocked_timeslots();
        let candidates = sixtop::select_add_candidates(
            num_cells,
            factor,
            slots_per_cell,
            slotframe_length,
            num_chans,
            mcs,
            |ts| !own_taken.contains(&ts) && !blocked.contains(&ts),
            rng,
        );
        if candidates.is_empty() {
            return Vec::new();
        }
        let n = self.sixtop.neighbor(neighbor);
        n.tx.state = Some(sixtop::TxState::SendingRequest);
        n.tx.op = Some(SixpOp::Add);
        n.tx.blocked = candidates.clone();

        let seq = n.tx.seq;
        let pkt = Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::SixpRequest(SixpRequestPayload {
                op: SixpOp::Add,
                cell_list: candidates,
                num_cells,
                seq,
            }),
            retries_left: crate::config::TSCH_MAXTXRETRIES,
            source: self.id,
            destination: Peer::Unicast(neighbor),
            source_route: Vec::new(),
            next_hop: Some(neighbor),
        };
        vec![Effect::Enqueue(pkt)]
    }

    /// Initiate a DELETE transaction for the cells selected by MSF policy.
    pub fn sixtop_initiate_delete(&mut self, neighbor: NodeId, cells: Vec<CellSpec>) -> Vec<Effect> {
        if cells.is_empty() {
            return Vec::new();
        }
        let n = self.sixtop.neighbor(neighbor);
        n.tx.state = Some(sixtop::TxState::SendingRequest);
        n.tx.op = Some(SixpOp::Delete);
        n.tx.blocked = cells.clone();
        let seq = n.tx.seq;
        let pkt = Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::SixpRequest(SixpRequestPayload {
                op: SixpOp::Delete,
                cell_list: cells.clone(),
                num_cells: cells.len() as u8,
                seq,
            }),
            retries_left: crate::config::TSCH_MAXTXRETRIES,
            source: self.id,
            destination: Peer::Unicast(neighbor),
            source_route: Vec::new(),
            next_hop: Some(neighbor),
        };
        vec![Effect::Enqueue(pkt)]
    }

    /// TX senddone ACK for a 6P request: arm the response timeout
    /// (spec §4.4 step 3).
    pub fn sixtop_on_request_senddone(&mut self, neighbor: NodeId, timeout_asns: u64) -> Vec<Effect> {
        let tag = EventTag(sixtop_tag(self.id, neighbor));
        let n = self.sixtop.neighbor(neighbor);
        n.tx.state = Some(sixtop::TxState::WaitResponse);
        n.tx.timeout_tag = Some(tag);
        let op = n.tx.op.unwrap_or(SixpOp::Add);
        vec![Effect::Schedule {
            delay: timeout_asns,
            priority: crate::engine::scheduler::PRIO_SIXTOP_TIMEOUT,
            tag: Some(tag),
            event: SelfEvent::SixtopTimeout { neighbor, op },
        }]
    }

    /// A 6P response arrived at/after its timer's ASN: discard, return to
    /// IDLE (spec §4.4 step 6, §8's "timer firing at the same ASN as a
    /// response: response is dropped").
    pub fn sixtop_on_timeout(&mut self, neighbor: NodeId) -> Vec<Effect> {
        let freed = self.sixtop.abort_tx(neighbor);
        let _ = freed;
        Vec::new()
    }

    /// Responder: handle an incoming 6P ADD/DELETE request (spec §4.4).
    pub fn sixtop_on_request_received(
        &mut self,
        neighbor: NodeId,
        req: &SixpRequestPayload,
        slots_for: impl Fn(u8) -> u8,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let already_active = !self.sixtop.rx_is_idle(neighbor);
        if already_active {
            let freed = self.sixtop.abort_rx(neighbor);
            let _ = freed;
            // A RESPONSE for the transaction we're resetting may already be
            // sitting in the TX queue; purge it so we never send a stale
            // grant after telling the initiator to reset (spec §4.4).
            let purged = self
                .queue
                .remove_matching(|p| matches!(p.payload, FramePayload::SixpResponse(_)) && p.destination == Peer::Unicast(neighbor));
            let _ = purged;
            let seq = self.sixtop.neighbors.get(&neighbor).map(|n| n.rx.seq).unwrap_or(0);
            let resp = self.build_response(neighbor, req.op, SixpReturnCode::Reset, Vec::new(), seq);
            effects.push(Effect::Enqueue(resp));
            return effects;
        }

        match req.op {
            SixpOp::Add => {
                let own_taken: std::collections::HashSet<u16> = self.schedule.iter().map(|c| c.timeslot).collect();
                let blocked = self.sixtop.all_blocked_timeslots();
                let is_free = |c: &CellSpec| {
                    let span = slots_for(c.mcs).max(1);
                    (0..span).all(|o| {
                        let t = c.timeslot + o as u16;
                        !own_taken.contains(&t) && !blocked.contains(&t)
                    })
                };
                let decision = sixtop::decide_add_response(&req.cell_list, req.num_cells, is_free);
                let n = self.sixtop.neighbor(neighbor);
                n.rx.state = Some(sixtop::RxState::WaitResponseSendDone);
                n.rx.op = Some(SixpOp::Add);
                n.rx.blocked = decision.to_block.clone();
                let seq = n.rx.seq;
                let resp = self.build_response(neighbor, SixpOp::Add, decision.code, decision.granted, seq);
                effects.push(Effect::Enqueue(resp));
            }
            SixpOp::Delete => {
                let n = self.sixtop.neighbor(neighbor);
                n.rx.state = Some(sixtop::RxState::WaitResponseSendDone);
                n.rx.op = Some(SixpOp::Delete);
                let seq = n.rx.seq;
                let resp = self.build_response(neighbor, SixpOp::Delete, SixpReturnCode::Success, req.cell_list.clone(), seq);
                effects.push(Effect::Enqueue(resp));
            }
        }
        effects
    }

    fn build_response(&self, neighbor: NodeId, op: SixpOp, code: SixpReturnCode, cells: Vec<CellSpec>, seq: u8) -> Packet {
        Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::SixpResponse(SixpResponsePayload { op, code, cell_list: cells, seq }),
            retries_left: crate::config::TSCH_MAXTXRETRIES,
            source: self.id,
            destination: Peer::Unicast(neighbor),
            source_route: Vec::new(),
            next_hop: Some(neighbor),
        }
    }

    /// Responder: after the response's TX senddone, install the granted
    /// cells (ADD) or remove them (DELETE) and return to IDLE (spec §4.4).
    pub fn sixtop_on_response_senddone(
        &mut self,
        neighbor: NodeId,
        slots_for: impl Fn(u8) -> u8,
        slotframe_length: u16,
    ) {
        let (op, granted) = {
            let n = self.sixtop.neighbor(neighbor);
            let granted = std::mem::take(&mut n.rx.blocked);
            let op = n.rx.op.take();
            n.rx.state = Some(sixtop::RxState::Idle);
            (op, granted)
        };
        match op {
            Some(SixpOp::Add) => {
                for c in granted {
                    let span = slots_for(c.mcs).max(1);
                    if span > 1 {
                        let _ = self.schedule.add_multi_slot_cell(
                            self.id,
                            c.timeslot,
                            span,
                            c.channel,
                            CellDirection::Rx,
                            Peer::Unicast(neighbor),
                            c.mcs,
                            slotframe_length,
                        );
                    } else {
                        let _ = self.schedule.add_cell(
                            self.id,
                            c.timeslot,
                            c.channel,
                            CellDirection::Rx,
                            Peer::Unicast(neighbor),
                            c.mcs,
                        );
                    }
                }
            }
            Some(SixpOp::Delete) => {
                for c in granted {
                    self.schedule.remove_cell(c.timeslot);
                }
            }
            None => {}
        }
        let n = self.sixtop.neighbor(neighbor);
        n.rx.seq = n.rx.seq.wrapping_add(1);
    }

    /// Initiator: handle a 6P response (spec §4.4 steps 4-6).
    pub fn sixtop_on_response_received(
        &mut self,
        neighbor: NodeId,
        resp: &SixpResponsePayload,
        slots_for: impl Fn(u8) -> u8,
        slotframe_length: u16,
    ) -> Vec<Effect> {
        let state_ok = self
            .sixtop
            .neighbors
            .get(&neighbor)
            .map(|n| {
                n.tx.state == Some(sixtop::TxState::WaitResponse) && n.tx.op == Some(resp.op) && n.tx.seq == resp.seq
            })
            .unwrap_or(false);
        let tag = self.sixtop.neighbors.get(&neighbor).and_then(|n| n.tx.timeout_tag);
        if !state_ok {
            // Wrong state/op, or a seqnum mismatch (spec §4.4 step 6):
            // discard and return to IDLE rather than acting on a stale or
            // unexpected response.
            let freed = self.sixtop.abort_tx(neighbor);
            let _ = freed;
            let mut effects = Vec::new();
            if let Some(tag) = tag {
                effects.push(Effect::Cancel(tag));
            }
            return effects;
        }
        let mut effects = Vec::new();
        if let Some(tag) = tag {
            effects.push(Effect::Cancel(tag));
        }

        match resp.code {
            SixpReturnCode::Success => {
                for c in &resp.cell_list {
                    let direction = match resp.op {
                        SixpOp::Add => CellDirection::Tx,
                        SixpOp::Delete => {
                            self.schedule.remove_cell(c.timeslot);
                            continue;
                        }
                    };
                    let span = slots_for(c.mcs).max(1);
                    if span > 1 {
                        let _ = self.schedule.add_multi_slot_cell(
                            self.id,
                            c.timeslot,
                            span,
                            c.channel,
                            direction,
                            Peer::Unicast(neighbor),
                            c.mcs,
                            slotframe_length,
                        );
                    } else {
                        let _ = self
                            .schedule
                            .add_cell(self.id, c.timeslot, c.channel, direction, Peer::Unicast(neighbor), c.mcs);
                    }
                }
                let freed = self.sixtop.abort_tx(neighbor);
                let _ = freed;
                let n = self.sixtop.neighbor(neighbor);
                n.tx.seq = n.tx.seq.wrapping_add(1);
            }
            SixpReturnCode::NoResources | SixpReturnCode::Busy | SixpReturnCode::Reset => {
                let freed = self.sixtop.abort_tx(neighbor);
                let _ = freed;
            }
        }
        effects
    }

    // ---------------------------------------------------------------
    // RPL (spec §4.5)
    // ---------------------------------------------------------------

    pub fn rpl_on_dio(&mut self, neighbor: NodeId, dio: &DioPayload) {
        self.rpl.record_dio(neighbor, dio.rank);
    }

    /// Run housekeeping; `parent_of` and cross-node loop detection are
    /// supplied by the caller from a cheap arena snapshot (spec §9).
    pub fn rpl_housekeeping(&mut self, parent_of: impl Fn(NodeId) -> Option<NodeId>) -> Option<NodeId> {
        let neighbors: Vec<NodeId> = self.rpl.neighbor_ranks.keys().copied().collect();
        let rank_increases: HashMap<NodeId, u32> =
            neighbors.iter().map(|&n| (n, self.rank_increase_to(n))).collect();
        self.rpl
            .housekeeping(self.id, parent_of, |n| rank_increases.get(&n).copied().unwrap_or(u32::MAX))
    }

    pub fn rpl_on_dao(&mut self, reporter: NodeId, parent: NodeId) {
        self.rpl.record_dao(reporter, parent);
    }

    // ---------------------------------------------------------------
    // Join (spec §4.7)
    // ---------------------------------------------------------------

    pub fn join_on_eb(&mut self) {
        self.join.on_eb_received();
    }

    // ---------------------------------------------------------------
    // Application & fragmentation (spec §4.8)
    // ---------------------------------------------------------------

    /// Generate one DATA (or FRAG series) frame if a preferred parent and
    /// at least one dedicated cell to it exist (spec §4.8).
    pub fn app_generate(&mut self, asn: Asn, num_fragments: u8, ilp_mode: bool) -> Vec<Effect> {
        let Some(parent) = self.rpl.preferred_parent else {
            return Vec::new();
        };
        if !ilp_mode && self.schedule.cells_to_peer(parent, None).is_empty() {
            return Vec::new();
        }
        let data = DataPayload {
            source: self.id,
            enqueue_asn: asn,
            hop_count: 1,
        };
        self.packets_generated += 1;
        if num_fragments > 1 {
            let frags = self.frag.fragment(data, num_fragments);
            frags
                .into_iter()
                .map(|f| Effect::Enqueue(Packet {
                    enqueue_asn: asn,
                    payload: FramePayload::Frag(f),
                    retries_left: crate::config::TSCH_MAXTXRETRIES,
                    source: self.id,
                    destination: Peer::Unicast(parent),
                    source_route: Vec::new(),
                    next_hop: Some(parent),
                }))
                .collect()
        } else {
            vec![Effect::Enqueue(Packet {
                enqueue_asn: asn,
                payload: FramePayload::Data(data),
                retries_left: crate::config::TSCH_MAXTXRETRIES,
                source: self.id,
                destination: Peer::Unicast(parent),
                source_route: Vec::new(),
                next_hop: Some(parent),
            })]
        }
    }

    /// Relay a non-root DATA/FRAG frame upward: bump hop count and enqueue
    /// toward the preferred parent, or drop if no route/cells (spec §4.8,
    /// §4.9).
    pub fn relay_upward(&mut self, mut data: DataPayload) -> Vec<Effect> {
        let Some(parent) = self.rpl.preferred_parent else {
            self.record_drop(DropReason::NoRoute);
            return vec![Effect::Dropped(DropReason::NoRoute)];
        };
        if self.schedule.cells_to_peer(parent, None).is_empty() {
            self.record_drop(DropReason::NoTxCells);
            return vec![Effect::Dropped(DropReason::NoTxCells)];
        }
        data.hop_count += 1;
        vec![Effect::Enqueue(Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::Data(data),
            retries_left: crate::config::TSCH_MAXTXRETRIES,
            source: self.id,
            destination: Peer::Unicast(parent),
            source_route: Vec::new(),
            next_hop: Some(parent),
        })]
    }
}

/// Deterministic 6top timeout timer tag for a given (local, remote) pair.
fn sixtop_tag(local: NodeId, remote: NodeId) -> u64 {
    ((local as u64) << 32) | remote as u64
}

#[derive(Debug)]
pub enum ActiveCellDecision {
    Rx { channel: u8 },
    /// `is_final_slot` is false for every constituent slot of a multi-slot
    /// frame except the last; the propagation coordinator only finalizes
    /// the frame's outcome (ACK/NACK, retry, delivery) once it sees `true`
    /// (spec §4.2 step 4).
    Tx { channel: u8, mcs: Mcs, packet: Box<Packet>, is_final_slot: bool },
    IdleListen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_cells_are_shared_broadcast() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        node.install_minimal_cells(2, 0);
        assert_eq!(node.schedule.len(), 2);
        assert!(node.schedule.get(0).unwrap().direction == CellDirection::Shared);
    }

    #[test]
    fn idle_queue_resets_broadcast_backoff() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        node.broadcast_backoff.backoff_on_failure(&mut rand::thread_rng());
        node.on_tx_outcome(0, Peer::Broadcast, false, true, 100);
        assert!(node.broadcast_backoff.ready());
    }

    #[test]
    fn response_senddone_installs_multi_slot_placeholders() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        let n = node.sixtop.neighbor(2);
        n.rx.op = Some(SixpOp::Add);
        n.rx.blocked = vec![CellSpec { timeslot: 10, channel: 3, mcs: 2 }];
        node.sixtop_on_response_senddone(2, |mcs| if mcs == 2 { 2 } else { 1 }, 101);
        assert!(node.schedule.get(10).unwrap().is_parent());
        let placeholder = node.schedule.get(11).unwrap();
        assert!(!placeholder.is_parent());
        assert_eq!(node.schedule.parent_of(11), Some(10));
    }

    #[test]
    fn multi_slot_tx_spans_consecutive_asns_and_any_interfered_slot_fails_the_frame() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        node.schedule
            .add_multi_slot_cell(1, 5, 2, 0, CellDirection::Tx, Peer::Unicast(2), 2, 101)
            .unwrap();
        node.queue
            .enqueue(Packet {
                enqueue_asn: Asn::ZERO,
                payload: FramePayload::Data(DataPayload { source: 1, enqueue_asn: Asn::ZERO, hop_count: 1 }),
                retries_left: crate::config::TSCH_MAXTXRETRIES,
                source: 1,
                destination: Peer::Unicast(2),
                source_route: Vec::new(),
                next_hop: Some(2),
            })
            .unwrap();
        let slots_for = |mcs: Mcs| if mcs == 2 { 2 } else { 1 };

        let (ts1, decision1) = node.decide_active_cell(Asn(5), 101, slots_for).expect("parent slot active");
        assert_eq!(ts1, 5);
        let is_final1 = match decision1 {
            ActiveCellDecision::Tx { is_final_slot, .. } => is_final_slot,
            other => panic!("expected Tx, got {other:?}"),
        };
        assert!(!is_final1);
        assert!(node.pending_tx.is_some());
        // Mid-span: the frame's outcome is still undecided even though this
        // slot succeeded.
        assert_eq!(node.note_multi_slot_tx_slot(true, is_final1), None);

        let (ts2, decision2) = node.decide_active_cell(Asn(6), 101, slots_for).expect("placeholder slot active");
        assert_eq!(ts2, 5);
        let is_final2 = match decision2 {
            ActiveCellDecision::Tx { is_final_slot, .. } => is_final_slot,
            other => panic!("expected Tx, got {other:?}"),
        };
        assert!(is_final2);
        // The second (final) constituent slot is interfered with: the whole
        // frame must be marked failed despite the first slot's success.
        assert_eq!(node.note_multi_slot_tx_slot(false, is_final2), Some(false));
        assert!(node.pending_tx.is_none());
    }

    #[test]
    fn single_slot_tx_outcome_is_decided_immediately() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        assert_eq!(node.note_multi_slot_tx_slot(true, true), Some(true));
        assert!(node.pending_tx.is_none());
    }

    #[test]
    fn response_with_mismatched_seq_is_discarded_and_resets_to_idle() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        let n = node.sixtop.neighbor(2);
        n.tx.state = Some(sixtop::TxState::WaitResponse);
        n.tx.op = Some(SixpOp::Add);
        n.tx.seq = 3;
        n.tx.blocked = vec![CellSpec { timeslot: 10, channel: 0, mcs: 0 }];

        let resp = SixpResponsePayload {
            op: SixpOp::Add,
            code: SixpReturnCode::Success,
            cell_list: vec![CellSpec { timeslot: 10, channel: 0, mcs: 0 }],
            seq: 9,
        };
        let effects = node.sixtop_on_response_received(2, &resp, |_| 1, 101);
        assert!(effects.is_empty());
        assert!(node.sixtop.tx_is_idle(2));
        // A discarded (mismatched-seq) response must not install any cells.
        assert!(node.schedule.get(10).is_none());
    }

    #[test]
    fn response_with_matching_seq_is_applied() {
        let cfg = Config::default();
        let mut node = Node::new(1, false, &cfg);
        let n = node.sixtop.neighbor(2);
        n.tx.state = Some(sixtop::TxState::WaitResponse);
        n.tx.op = Some(SixpOp::Add);
        n.tx.seq = 3;
        n.tx.blocked = vec![CellSpec { timeslot: 10, channel: 0, mcs: 0 }];

        let resp = SixpResponsePayload {
            op: SixpOp::Add,
            code: SixpReturnCode::Success,
            cell_list: vec![CellSpec { timeslot: 10, channel: 0, mcs: 0 }],
            seq: 3,
        };
        node.sixtop_on_response_received(2, &resp, |_| 1, 101);
        assert!(node.schedule.get(10).unwrap().is_parent());
        assert!(node.sixtop.tx_is_idle(2));
    }
}
