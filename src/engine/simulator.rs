//! The Mote container's engine half: owns the node arena plus every
//! collaborator, bootstraps the network, and drives the event scheduler
//! end to end (spec §2 "Mote container... wires the above; owns state",
//! §4.1, §4.5-§4.8, §9's "explicit simulation context").
//!
//! Node methods never touch the scheduler or reach into a neighbor's state
//! directly (spec §9); they return [`crate::node::Effect`]s instead. This
//! module is the only place those effects become scheduler calls, queue
//! mutations, or cross-node lookups (e.g. "does node X have a loop back to
//! me", computed here from a snapshot of the arena rather than exposed as a
//! live reference on `Node`).

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;

use crate::collaborators::ilp::IlpImporter;
use crate::collaborators::modulation::Modulation;
use crate::collaborators::statistics::Statistics;
use crate::collaborators::topology::Topology;
use crate::config::{Config, SchedulingFunction, TSCH_MAXTXRETRIES};
use crate::engine::propagation::{self, apply_effects};
use crate::engine::scheduler::{self, EventScheduler, EventTag};
use crate::node::schedule::CellDirection;
use crate::node::{Effect, Node, SelfEvent};
use crate::packet::{CellSpec, DaoPayload, DioPayload, FramePayload, JoinPayload, NodeId, Packet, Peer};
use crate::rng::RngStream;
use crate::time::Asn;

/// Everything a scheduled callback needs, threaded explicitly through every
/// call instead of living behind a process-wide singleton (spec §9's design
/// note on mutable global state).
pub struct SimContext {
    pub nodes: HashMap<NodeId, Node>,
    pub config: Config,
    pub topology: Box<dyn Topology>,
    pub modulation: Box<dyn Modulation>,
    pub ilp: Box<dyn IlpImporter>,
    pub statistics: Box<dyn Statistics>,
    pub root: NodeId,
    /// Per-(node, stream) generators, created lazily and then persisted so
    /// successive draws actually advance rather than replaying the same
    /// value every call (spec §5's per-stream determinism).
    pub rngs: HashMap<(NodeId, RngStream), StdRng>,
    /// Requests raised while handling the event that just ran; drained into
    /// the scheduler immediately afterwards (spec §9: `Node` never reaches
    /// the scheduler itself).
    pub pending_schedules: Vec<PendingSchedule>,
    pub pending_cancels: Vec<EventTag>,
    /// `(receiver, hop_count, latency_slots)` for every DATA frame that
    /// reached the root while processing the event that just ran.
    pub delivered: Vec<(NodeId, u16, u64)>,
    pub packets_delivered_total: u64,
    /// ASN after which periodic self-events stop re-arming themselves (spec
    /// §4.7: "when every node is joined... terminate after
    /// `numCyclesPerRun` additional cycles").
    pub terminate_at: Option<Asn>,
}

impl SimContext {
    pub fn should_continue(&self, asn: Asn) -> bool {
        match self.terminate_at {
            Some(t) => asn < t,
            None => true,
        }
    }
}

pub struct PendingSchedule {
    pub delay: u64,
    pub priority: u8,
    pub tag: Option<EventTag>,
    pub kind: EventKind,
}

pub enum EventKind {
    ActiveCellSlot,
    NodeSelf { node: NodeId, event: SelfEvent },
}

/// Reserved tags outside the per-(node,kind) periodic namespace (bit 63) and
/// the 6top-timeout namespace `Node` allocates internally (`local << 32 |
/// remote`, which never sets bit 62/63 for any realistic node count).
const TAG_ACTIVE_CELL: EventTag = EventTag(1 << 62);
const TAG_PERIODIC_FLAG: u64 = 1 << 63;

const KIND_EB: u8 = 1;
const KIND_DIO: u8 = 2;
const KIND_DAO: u8 = 3;
const KIND_APP: u8 = 4;
const KIND_JOIN_RETRY: u8 = 5;
const KIND_MSF_HOUSEKEEPING: u8 = 6;
const KIND_MSF_PARENT_CHANGE: u8 = 7;

fn periodic_tag(node: NodeId, kind: u8) -> EventTag {
    EventTag(TAG_PERIODIC_FLAG | ((node as u64) << 8) | kind as u64)
}

/// Borrow a node's persistent RNG stream without taking `&mut SimContext`
/// (so callers can simultaneously hold a disjoint `&mut ctx.nodes` borrow).
fn rng_for(rngs: &mut HashMap<(NodeId, RngStream), StdRng>, seed: u64, node: NodeId, stream: RngStream) -> &mut StdRng {
    rngs.entry((node, stream)).or_insert_with(|| crate::rng::stream_rng(seed, node, stream))
}

/// The simulation: a priority-ordered event scheduler plus the context its
/// callbacks operate on (spec §2, §4.1, §5).
pub struct Simulation {
    scheduler: EventScheduler<SimContext>,
    ctx: SimContext,
}

impl Simulation {
    pub fn new(
        config: Config,
        mut topology: Box<dyn Topology>,
        modulation: Box<dyn Modulation>,
        ilp: Box<dyn IlpImporter>,
        statistics: Box<dyn Statistics>,
    ) -> Self {
        let num_nodes = config.num_nodes;
        let profile = config.modulation_config.profile.clone();
        topology.place(num_nodes);
        let minimal_mcs = modulation.minimal_cell_modulation(&profile);

        let mut nodes: HashMap<NodeId, Node> = HashMap::new();
        for id in 0..num_nodes {
            let mut node = Node::new(id, id == 0, &config);
            node.install_minimal_cells(config.nr_minimal_cells, minimal_mcs);
            nodes.insert(id, node);
        }
        for a in 0..num_nodes {
            for b in 0..num_nodes {
                if a == b {
                    continue;
                }
                let rssi = topology.rssi(a, b);
                let pdr = topology.rssi_to_pdr(rssi, minimal_mcs);
                if let Some(node) = nodes.get_mut(&a) {
                    node.set_neighbor(b, rssi, pdr, minimal_mcs, &config);
                }
            }
        }

        if config.sf == SchedulingFunction::Ilp {
            let slotframe_length = config.slotframe_length;
            for id in 0..num_nodes {
                let imported = ilp.import(id);
                if let Some(node) = nodes.get_mut(&id) {
                    for cell in imported {
                        let direction = match cell.direction {
                            crate::collaborators::ilp::CellDirection::Tx => CellDirection::Tx,
                            crate::collaborators::ilp::CellDirection::Rx => CellDirection::Rx,
                            crate::collaborators::ilp::CellDirection::Shared => CellDirection::Shared,
                        };
                        if cell.slots > 1 {
                            let _ = node.schedule.add_multi_slot_cell(
                                id,
                                cell.timeslot,
                                cell.slots,
                                cell.channel,
                                direction,
                                cell.peer,
                                cell.mcs,
                                slotframe_length,
                            );
                        } else {
                            let _ = node.schedule.add_cell(id, cell.timeslot, cell.channel, direction, cell.peer, cell.mcs);
                        }
                    }
                }
            }
        }

        let mut ctx = SimContext {
            nodes,
            root: 0,
            rngs: HashMap::new(),
            pending_schedules: Vec::new(),
            pending_cancels: Vec::new(),
            delivered: Vec::new(),
            packets_delivered_total: 0,
            terminate_at: None,
            config,
            topology,
            modulation,
            ilp,
            statistics,
        };

        let mut scheduler: EventScheduler<SimContext> = EventScheduler::new();
        scheduler
            .schedule_at_asn(Asn::ZERO, scheduler::PRIO_ACTIVE_CELL, Some(TAG_ACTIVE_CELL), |ctx, asn| {
                dispatch(ctx, EventKind::ActiveCellSlot, asn);
            })
            .expect("ASN 0 is always schedulable at construction");

        if ctx.config.beacon_period > 0.0 {
            arm_periodic(&mut scheduler, ctx.root, KIND_EB, 0, scheduler::PRIO_BROADCAST_TX, SelfEvent::SendEb);
        }
        // The root always has a defined rank (0); it starts advertising
        // immediately regardless of join (spec §4.5: root emits DIO from
        // the start of the run).
        if ctx.config.dio_period > 0.0 {
            arm_periodic(&mut scheduler, ctx.root, KIND_DIO, 0, scheduler::PRIO_BROADCAST_TX, SelfEvent::SendDio);
        }

        Simulation { scheduler, ctx }
    }

    pub fn ctx(&self) -> &SimContext {
        &self.ctx
    }

    pub fn current_asn(&self) -> Asn {
        self.scheduler.asn()
    }

    /// Run until the queue drains or `until` (exclusive) is reached.
    pub fn run_until(&mut self, until: Asn) {
        loop {
            match self.scheduler.peek_asn() {
                Some(asn) if asn < until => {}
                _ => break,
            }
            if !self.step() {
                break;
            }
        }
    }

    /// Run `asns` slots forward (or until every periodic driver has stopped
    /// re-arming itself and the queue drains, whichever comes first).
    pub fn run_for(&mut self, asns: u64) {
        let start = self.scheduler.asn();
        self.run_until(start + asns);
    }

    /// Run to completion: until termination fires (spec §4.7) and every
    /// periodic driver has stopped re-arming itself, draining the event
    /// queue. The only error this can surface is an invariant violation
    /// (spec §7); none of the engine's own scheduling calls can currently
    /// produce one once construction has succeeded.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while self.step() {}
        Ok(())
    }

    fn step(&mut self) -> bool {
        if !self.scheduler.pop_and_run(&mut self.ctx) {
            return false;
        }
        self.drain_pending();
        true
    }

    fn drain_pending(&mut self) {
        for tag in self.ctx.pending_cancels.drain(..) {
            self.scheduler.remove_event(tag);
        }
        let schedules: Vec<PendingSchedule> = self.ctx.pending_schedules.drain(..).collect();
        for ps in schedules {
            let kind = ps.kind;
            let _ = self
                .scheduler
                .schedule_in(ps.delay, ps.priority, ps.tag, move |ctx, asn| dispatch(ctx, kind, asn));
        }
        for (node_id, hop_count, latency_slots) in self.ctx.delivered.drain(..) {
            if let Some(node) = self.ctx.nodes.get_mut(&node_id) {
                node.packets_delivered += 1;
            }
            self.ctx.packets_delivered_total += 1;
            log::info!(
                "delivery: node={node_id} hop_count={hop_count} latency_slots={latency_slots}"
            );
        }
    }
}

fn arm_periodic(
    scheduler: &mut EventScheduler<SimContext>,
    node: NodeId,
    kind: u8,
    delay: u64,
    priority: u8,
    event: SelfEvent,
) {
    let tag = periodic_tag(node, kind);
    let _ = scheduler.schedule_in(delay, priority, Some(tag), move |ctx, asn| {
        dispatch(ctx, EventKind::NodeSelf { node, event }, asn);
    });
}

fn dispatch(ctx: &mut SimContext, kind: EventKind, asn: Asn) {
    match kind {
        EventKind::ActiveCellSlot => {
            propagation::run_slot(ctx, asn);
            if ctx.should_continue(asn) {
                ctx.pending_schedules.push(PendingSchedule {
                    delay: 1,
                    priority: scheduler::PRIO_ACTIVE_CELL,
                    tag: Some(TAG_ACTIVE_CELL),
                    kind: EventKind::ActiveCellSlot,
                });
            }
        }
        EventKind::NodeSelf { node, event } => on_self_event(ctx, node, event, asn),
    }
}

/// Generic period-with-jitter delay in slots, shared by EB/DIO/DAO/app
/// traffic cadences (spec §4.3 EB emission, §4.5 DIO/DAO, §4.8 app traffic).
fn jittered_slots(ctx: &mut SimContext, node: NodeId, period_secs: f64, jitter_frac: f64, stream: RngStream) -> u64 {
    let rng = rng_for(&mut ctx.rngs, ctx.config.seed, node, stream);
    crate::node::app::next_generation_delay_slots(period_secs, jitter_frac, ctx.config.slot_duration, rng)
}

fn make_packet(source: NodeId, destination: Peer, next_hop: Option<NodeId>, payload: FramePayload, asn: Asn) -> Packet {
    Packet {
        enqueue_asn: asn,
        payload,
        retries_left: TSCH_MAXTXRETRIES,
        source,
        destination,
        source_route: Vec::new(),
        next_hop,
    }
}

fn on_self_event(ctx: &mut SimContext, node_id: NodeId, event: SelfEvent, asn: Asn) {
    match event {
        SelfEvent::SendEb => {
            let pkt = make_packet(node_id, Peer::Broadcast, None, FramePayload::Eb, asn);
            let mut effects = vec![Effect::Enqueue(pkt)];
            if ctx.should_continue(asn) && ctx.config.beacon_period > 0.0 {
                let delay = jittered_slots(ctx, node_id, ctx.config.beacon_period, 0.2, RngStream::Broadcast);
                effects.push(Effect::Schedule {
                    delay,
                    priority: scheduler::PRIO_BROADCAST_TX,
                    tag: Some(periodic_tag(node_id, KIND_EB)),
                    event: SelfEvent::SendEb,
                });
            }
            apply_effects(ctx, node_id, effects);
        }
        SelfEvent::SendDio => {
            let Some(node) = ctx.nodes.get(&node_id) else { return };
            let rank = node.rpl.rank;
            let pkt = make_packet(node_id, Peer::Broadcast, None, FramePayload::Dio(DioPayload { rank }), asn);
            let mut effects = vec![Effect::Enqueue(pkt)];
            if ctx.should_continue(asn) && ctx.config.dio_period > 0.0 {
                let delay = jittered_slots(ctx, node_id, ctx.config.dio_period, 0.2, RngStream::Broadcast);
                effects.push(Effect::Schedule {
                    delay,
                    priority: scheduler::PRIO_BROADCAST_TX,
                    tag: Some(periodic_tag(node_id, KIND_DIO)),
                    event: SelfEvent::SendDio,
                });
            }
            apply_effects(ctx, node_id, effects);
        }
        SelfEvent::SendDao => {
            let Some(node) = ctx.nodes.get(&node_id) else { return };
            if node.is_root {
                return;
            }
            let mut effects = Vec::new();
            if let Some(parent) = node.rpl.preferred_parent {
                let pkt = make_packet(
                    node_id,
                    Peer::Unicast(ctx.root),
                    Some(parent),
                    FramePayload::Dao(DaoPayload { reporter: node_id, parent }),
                    asn,
                );
                effects.push(Effect::Enqueue(pkt));
            }
            if ctx.should_continue(asn) && ctx.config.dao_period > 0.0 {
                let delay = jittered_slots(ctx, node_id, ctx.config.dao_period, 0.2, RngStream::Broadcast);
                effects.push(Effect::Schedule {
                    delay,
                    priority: scheduler::PRIO_BROADCAST_TX,
                    tag: Some(periodic_tag(node_id, KIND_DAO)),
                    event: SelfEvent::SendDao,
                });
            }
            apply_effects(ctx, node_id, effects);
        }
        SelfEvent::AppGenerate => {
            let ilp_mode = ctx.config.sf == SchedulingFunction::Ilp;
            let num_fragments = ctx.config.num_fragments;
            if let Some(node) = ctx.nodes.get_mut(&node_id) {
                let effects = node.app_generate(asn, num_fragments, ilp_mode);
                apply_effects(ctx, node_id, effects);
            }
            if ctx.should_continue(asn) {
                let delay = jittered_slots(ctx, node_id, ctx.config.pk_period, ctx.config.pk_period_var, RngStream::Sporadic);
                ctx.pending_schedules.push(PendingSchedule {
                    delay,
                    priority: scheduler::PRIO_APP_JOIN,
                    tag: Some(periodic_tag(node_id, KIND_APP)),
                    kind: EventKind::NodeSelf { node: node_id, event: SelfEvent::AppGenerate },
                });
            }
        }
        SelfEvent::JoinRetry => on_join_retry(ctx, node_id, asn),
        SelfEvent::MsfHousekeeping => {
            // Bandwidth increase/decrease hooks are disabled in the default
            // path (spec §4.6); this tick doubles as the cadence on which
            // per-mote counters are pushed to the statistics collaborator
            // (spec §6's `getMoteStats()`).
            report_mote_stats(ctx, node_id, asn);
            if ctx.should_continue(asn) && ctx.config.msf_housekeeping_period > 0.0 {
                let delay = (ctx.config.msf_housekeeping_period / ctx.config.slot_duration).round().max(1.0) as u64;
                ctx.pending_schedules.push(PendingSchedule {
                    delay,
                    priority: scheduler::PRIO_MSF,
                    tag: Some(periodic_tag(node_id, KIND_MSF_HOUSEKEEPING)),
                    kind: EventKind::NodeSelf { node: node_id, event: SelfEvent::MsfHousekeeping },
                });
            }
        }
        SelfEvent::MsfParentChangeTick => on_msf_parent_change_tick(ctx, node_id, asn),
        SelfEvent::SixtopTimeout { neighbor, op } => {
            let _ = op;
            if let Some(node) = ctx.nodes.get_mut(&node_id) {
                let effects = node.sixtop_on_timeout(neighbor);
                apply_effects(ctx, node_id, effects);
            }
        }
    }
}

/// Snapshot one node's counters into the statistics collaborator (spec §6).
fn report_mote_stats(ctx: &mut SimContext, node_id: NodeId, asn: Asn) {
    let Some(node) = ctx.nodes.get(&node_id) else { return };
    let d = &node.drop_counts;
    let get = |name: &str| d.get(name).copied().unwrap_or(0);
    let stats = crate::collaborators::statistics::MoteStats {
        rank: node.rpl.rank,
        dropped_no_route: get(crate::error::DropReason::NoRoute.counter_name()),
        dropped_no_tx_cells: get(crate::error::DropReason::NoTxCells.counter_name()),
        dropped_queue_full: get(crate::error::DropReason::QueueFull.counter_name()),
        dropped_mac_retries: get(crate::error::DropReason::MacRetries.counter_name()),
        dropped_frag_failed_enqueue: get(crate::error::DropReason::FragFailedEnqueue.counter_name()),
        dropped_frag_vrb_table_full: get(crate::error::DropReason::FragVRBTableFull.counter_name()),
        dropped_frag_reass_queue_full: get(crate::error::DropReason::FragReassQueueFull.counter_name()),
        dropped_frag_missing_frag: get(crate::error::DropReason::FragMissingFrag.counter_name()),
        packets_generated: node.packets_generated,
        packets_delivered_to_root: node.packets_delivered,
        charge_tx: node.energy.tx + node.energy.tx_data,
        charge_rx: node.energy.rx + node.energy.rx_data,
        charge_idle_listen: node.energy.idle_listen,
        charge_sleep: node.energy.sleep,
    };
    ctx.statistics.on_mote_stats(asn, node_id, stats);
}

/// Start (or resend) the join token exchange (spec §4.7): sent hop-by-hop
/// toward the root over the current preferred-parent route, accumulating
/// the path in `source_route` so the root can reply along the same hops.
fn on_join_retry(ctx: &mut SimContext, node_id: NodeId, asn: Asn) {
    let Some(node) = ctx.nodes.get_mut(&node_id) else { return };
    if node.join.is_joined() {
        return;
    }
    use crate::node::join::JoinPhase;
    if node.join.phase == JoinPhase::SyncedPendingJoin {
        node.join.initiate(ctx.config.join_num_exchanges);
    }
    let token = node.join.remaining_tokens;
    let parent = node.rpl.preferred_parent;
    let mut effects = Vec::new();
    if let Some(parent) = parent {
        let mut pkt = make_packet(node_id, Peer::Unicast(ctx.root), Some(parent), FramePayload::Join(JoinPayload { token }), asn);
        pkt.source_route = vec![node_id];
        effects.push(Effect::Enqueue(pkt));
    }
    if ctx.should_continue(asn) {
        let delay = ((ctx.config.slot_duration + ctx.config.join_attempt_timeout) / ctx.config.slot_duration).round().max(1.0) as u64;
        effects.push(Effect::Schedule {
            delay,
            priority: scheduler::PRIO_APP_JOIN,
            tag: Some(periodic_tag(node_id, KIND_JOIN_RETRY)),
            event: SelfEvent::JoinRetry,
        });
    }
    apply_effects(ctx, node_id, effects);
}

/// Drive one MSF parent-change step (spec §4.6 steps 1-4): ADD to the new
/// parent if there are no cells there yet, else DELETE from the old one.
fn on_msf_parent_change_tick(ctx: &mut SimContext, node_id: NodeId, asn: Asn) {
    let Some(parent) = ctx.nodes.get(&node_id).and_then(|n| n.rpl.preferred_parent) else { return };
    let Some((old_parent, attempts_left)) = ctx
        .nodes
        .get(&node_id)
        .and_then(|n| n.msf.parent_change.as_ref())
        .map(|s| (s.old_parent, s.attempts_left))
    else {
        return;
    };

    let cells_to_new = ctx.nodes[&node_id].schedule.cells_to_peer(parent, None).len();
    if cells_to_new == 0 {
        let cells_to_old = old_parent
            .map(|p| ctx.nodes[&node_id].schedule.cells_to_peer(p, None).len())
            .unwrap_or(0);
        let want = cells_to_old.max(ctx.config.min_cells_msf as usize) as u8;
        initiate_add(ctx, node_id, parent, want, asn);
    } else if let Some(old) = old_parent {
        let cell_ts = ctx.nodes[&node_id].schedule.cells_to_peer(old, None);
        if !cell_ts.is_empty() && attempts_left > 0 {
            let cells: Vec<CellSpec> = cell_ts
                .iter()
                .filter_map(|&ts| {
                    ctx.nodes[&node_id]
                        .schedule
                        .get(ts)
                        .map(|c| CellSpec { timeslot: ts, channel: c.channel, mcs: c.modulation })
                })
                .collect();
            initiate_delete(ctx, node_id, old, cells, asn);
            if let Some(state) = ctx.nodes.get_mut(&node_id).and_then(|n| n.msf.parent_change.as_mut()) {
                state.attempts_left = state.attempts_left.saturating_sub(1);
            }
        }
    }

    let (done, attempts_left_now) = {
        let node = &ctx.nodes[&node_id];
        let cells_old_now = old_parent.map(|p| node.schedule.cells_to_peer(p, None).len()).unwrap_or(0);
        let attempts_now = node.msf.parent_change.as_ref().map(|s| s.attempts_left).unwrap_or(0);
        (cells_old_now == 0 || attempts_now == 0, attempts_now)
    };
    let _ = attempts_left_now;

    if done {
        if let Some(node) = ctx.nodes.get_mut(&node_id) {
            node.msf.parent_change = None;
            node.msf.parent_change_tag = None;
        }
        return;
    }
    if ctx.should_continue(asn) {
        // spec §4.6 step 3: 25s cadence for the very first (bootstrap)
        // parent, 300s for every later churn.
        let period = if old_parent.is_none() { 25.0 } else { 300.0 };
        let delay = (period / ctx.config.slot_duration).round().max(1.0) as u64;
        let tag = periodic_tag(node_id, KIND_MSF_PARENT_CHANGE);
        ctx.pending_schedules.push(PendingSchedule {
            delay,
            priority: scheduler::PRIO_MSF,
            tag: Some(tag),
            kind: EventKind::NodeSelf { node: node_id, event: SelfEvent::MsfParentChangeTick },
        });
    }
}

fn initiate_add(ctx: &mut SimContext, local: NodeId, remote: NodeId, want: u8, asn: Asn) {
    let slotframe_length = ctx.config.slotframe_length;
    let factor = ctx.config.msf_min_num_cells_factor;
    let num_chans = ctx.config.num_chans;
    let mcs = ctx
        .nodes
        .get(&local)
        .and_then(|n| n.neighbors.get(&remote))
        .map(|l| l.modulation)
        .unwrap_or(0);
    let slots_per_cell = if ctx.config.modulation_config.individual_modulations {
        ctx.modulation.slots(&ctx.config.modulation_config.profile, mcs)
    } else {
        1
    };
    if ctx.config.sixtop_messaging {
        let rng = rng_for(&mut ctx.rngs, ctx.config.seed, local, RngStream::Msf);
        let Some(node) = ctx.nodes.get_mut(&local) else { return };
        let effects = node.sixtop_initiate_add(remote, want, factor, slots_per_cell, slotframe_length, num_chans, mcs, rng);
        apply_effects(ctx, local, effects);
    } else {
        instant_add_cells(ctx, local, remote, want, factor, slotframe_length, num_chans, slots_per_cell, mcs);
    }
    let _ = asn;
}

fn initiate_delete(ctx: &mut SimContext, local: NodeId, remote: NodeId, cells: Vec<CellSpec>, asn: Asn) {
    if ctx.config.sixtop_messaging {
        let Some(node) = ctx.nodes.get_mut(&local) else { return };
        let effects = node.sixtop_initiate_delete(remote, cells);
        apply_effects(ctx, local, effects);
    } else {
        instant_remove_cells(ctx, local, remote, cells);
    }
    let _ = asn;
}

/// `sixtopMessaging = false` testing shortcut (spec §6): install/remove both
/// sides' matching cells directly, bypassing the reliable 6P exchange.
fn instant_add_cells(
    ctx: &mut SimContext,
    local: NodeId,
    remote: NodeId,
    want: u8,
    factor: u8,
    slotframe_length: u16,
    num_chans: u8,
    slots_per_cell: u8,
    mcs: u8,
) {
    let local_taken: HashSet<u16> = ctx.nodes[&local].schedule.iter().map(|c| c.timeslot).collect();
    let remote_taken: HashSet<u16> = ctx.nodes[&remote].schedule.iter().map(|c| c.timeslot).collect();
    let rng = rng_for(&mut ctx.rngs, ctx.config.seed, local, RngStream::Msf);
    let candidates = crate::node::sixtop::select_add_candidates(
        want,
        factor,
        slots_per_cell,
        slotframe_length,
        num_chans,
        mcs,
        |ts| !local_taken.contains(&ts) && !remote_taken.contains(&ts),
        rng,
    );
    for c in candidates {
        if slots_per_cell > 1 {
            if let Some(node) = ctx.nodes.get_mut(&local) {
                let _ = node.schedule.add_multi_slot_cell(
                    local,
                    c.timeslot,
                    slots_per_cell,
                    c.channel,
                    CellDirection::Tx,
                    Peer::Unicast(remote),
                    c.mcs,
                    slotframe_length,
                );
            }
            if let Some(node) = ctx.nodes.get_mut(&remote) {
                let _ = node.schedule.add_multi_slot_cell(
                    remote,
                    c.timeslot,
                    slots_per_cell,
                    c.channel,
                    CellDirection::Rx,
                    Peer::Unicast(local),
                    c.mcs,
                    slotframe_length,
                );
            }
        } else {
            if let Some(node) = ctx.nodes.get_mut(&local) {
                let _ = node.schedule.add_cell(local, c.timeslot, c.channel, CellDirection::Tx, Peer::Unicast(remote), c.mcs);
            }
            if let Some(node) = ctx.nodes.get_mut(&remote) {
                let _ = node.schedule.add_cell(remote, c.timeslot, c.channel, CellDirection::Rx, Peer::Unicast(local), c.mcs);
            }
        }
    }
}

fn instant_remove_cells(ctx: &mut SimContext, local: NodeId, remote: NodeId, cells: Vec<CellSpec>) {
    for c in cells {
        if let Some(node) = ctx.nodes.get_mut(&local) {
            node.schedule.remove_cell(c.timeslot);
        }
        if let Some(node) = ctx.nodes.get_mut(&remote) {
            node.schedule.remove_cell(c.timeslot);
        }
    }
}

/// Begin the "remaining stack" (spec §4.7): EB/DAO emission and MSF
/// housekeeping, plus the application generator, plus the MSF parent-change
/// choreography toward the already-selected preferred parent.
fn start_remaining_stack(ctx: &mut SimContext, node_id: NodeId, asn: Asn) {
    let is_root = ctx.nodes.get(&node_id).map(|n| n.is_root).unwrap_or(false);
    if !is_root && ctx.config.beacon_period > 0.0 {
        arm_periodic_ctx(ctx, node_id, KIND_EB, 0, scheduler::PRIO_BROADCAST_TX, SelfEvent::SendEb);
    }
    if !is_root && ctx.config.dao_period > 0.0 {
        arm_periodic_ctx(ctx, node_id, KIND_DAO, 0, scheduler::PRIO_BROADCAST_TX, SelfEvent::SendDao);
    }
    if ctx.config.msf_housekeeping_period > 0.0 {
        arm_periodic_ctx(ctx, node_id, KIND_MSF_HOUSEKEEPING, 0, scheduler::PRIO_MSF, SelfEvent::MsfHousekeeping);
    }
    arm_periodic_ctx(ctx, node_id, KIND_APP, 0, scheduler::PRIO_APP_JOIN, SelfEvent::AppGenerate);
    let _ = asn;
}

fn arm_periodic_ctx(ctx: &mut SimContext, node: NodeId, kind: u8, delay: u64, priority: u8, event: SelfEvent) {
    ctx.pending_schedules.push(PendingSchedule {
        delay,
        priority,
        tag: Some(periodic_tag(node, kind)),
        kind: EventKind::NodeSelf { node, event },
    });
}

/// Kick off (or re-kick-off) the MSF parent-change choreography toward
/// `new_parent` (spec §4.5 step 5, §4.6).
fn begin_parent_change(ctx: &mut SimContext, node_id: NodeId, old_parent: Option<NodeId>, asn: Asn) {
    let tag = periodic_tag(node_id, KIND_MSF_PARENT_CHANGE);
    if let Some(node) = ctx.nodes.get_mut(&node_id) {
        node.msf.parent_change = Some(crate::node::msf::ParentChangeState {
            old_parent,
            attempts_left: ctx.config.msf_max_old_parent_removal,
        });
        node.msf.parent_change_tag = Some(tag);
    }
    ctx.pending_cancels.push(tag);
    ctx.pending_schedules.push(PendingSchedule {
        delay: 0,
        priority: scheduler::PRIO_MSF,
        tag: Some(tag),
        kind: EventKind::NodeSelf { node: node_id, event: SelfEvent::MsfParentChangeTick },
    });
    let _ = asn;
}

/// Dispatch a just-received frame to the right protocol layer (spec §4.1's
/// demux: RPL/6top/Join/App), returning the effects the caller applies.
pub fn demux_received(ctx: &mut SimContext, receiver: NodeId, sender: NodeId, packet: Packet, asn: Asn) -> Vec<Effect> {
    match packet.payload {
        FramePayload::Data(data) => on_data_received(ctx, receiver, data, asn),
        FramePayload::Frag(frag) => on_frag_received(ctx, receiver, sender, frag, asn),
        FramePayload::Ack => Vec::new(), // link-layer ACK is modeled as a boolean outcome, never an explicit frame
        FramePayload::Eb => on_eb_received(ctx, receiver, asn),
        FramePayload::Dio(dio) => on_dio_received(ctx, receiver, sender, dio, asn),
        FramePayload::Dao(dao) => on_dao_received(ctx, receiver, dao, asn),
        FramePayload::Join(payload) => {
            on_join_received(ctx, receiver, packet.source, packet.destination, packet.source_route, payload, asn)
        }
        FramePayload::SixpRequest(req) => {
            let profile = ctx.config.modulation_config.profile.clone();
            let modulation = &ctx.modulation;
            let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
            node.sixtop_on_request_received(sender, &req, |mcs| modulation.slots(&profile, mcs))
        }
        FramePayload::SixpResponse(resp) => {
            let profile = ctx.config.modulation_config.profile.clone();
            let slotframe_length = ctx.config.slotframe_length;
            let modulation = &ctx.modulation;
            let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
            node.sixtop_on_response_received(sender, &resp, |mcs| modulation.slots(&profile, mcs), slotframe_length)
        }
    }
}

fn on_data_received(ctx: &mut SimContext, receiver: NodeId, data: crate::packet::DataPayload, asn: Asn) -> Vec<Effect> {
    if receiver == ctx.root {
        let latency = asn.saturating_sub(data.enqueue_asn);
        return vec![Effect::Delivered { hop_count: data.hop_count, latency_slots: latency }];
    }
    let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
    node.relay_upward(data)
}

fn on_frag_received(ctx: &mut SimContext, receiver: NodeId, sender: NodeId, frag: crate::packet::FragPayload, asn: Asn) -> Vec<Effect> {
    let slot_duration = ctx.config.slot_duration;
    let kill = ctx.config.kill_entry_by_missing;
    if receiver == ctx.root {
        let num_reass_queue = ctx.config.num_reass_queue;
        let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
        use crate::node::app::ReassemblyOutcome;
        match node.frag.on_fragment_received(sender, &frag, asn, slot_duration, num_reass_queue, kill) {
            ReassemblyOutcome::Complete(data) => {
                let latency = asn.saturating_sub(data.enqueue_asn);
                vec![Effect::Delivered { hop_count: data.hop_count, latency_slots: latency }]
            }
            ReassemblyOutcome::Pending => Vec::new(),
            ReassemblyOutcome::KilledByMissing => vec![Effect::Dropped(crate::error::DropReason::FragMissingFrag)],
            ReassemblyOutcome::QueueFull => vec![Effect::Dropped(crate::error::DropReason::FragReassQueueFull)],
        }
    } else if ctx.config.enable_fragment_forwarding {
        // Relay via the Virtual Reassembly Buffer rather than full
        // reassembly (spec §3, §4.8).
        let max_vrb = ctx.config.max_vrb_entry_num;
        let parent = ctx.nodes.get(&receiver).and_then(|n| n.rpl.preferred_parent);
        let Some(parent) = parent else {
            return vec![Effect::Dropped(crate::error::DropReason::NoRoute)];
        };
        let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
        match node.frag.vrb_forward(sender, &frag, asn, slot_duration, max_vrb, kill) {
            Ok(out_tag) => {
                let mut fwd = frag;
                fwd.tag = out_tag;
                vec![Effect::Enqueue(make_packet(
                    receiver,
                    Peer::Unicast(ctx.root),
                    Some(parent),
                    FramePayload::Frag(fwd),
                    asn,
                ))]
            }
            Err(reason) => vec![Effect::Dropped(reason)],
        }
    } else {
        // Forwarding disabled: relay the fragment verbatim toward the
        // preferred parent, one hop at a time, without VRB bookkeeping.
        let parent = ctx.nodes.get(&receiver).and_then(|n| n.rpl.preferred_parent);
        match parent {
            Some(parent) => vec![Effect::Enqueue(make_packet(
                receiver,
                Peer::Unicast(ctx.root),
                Some(parent),
                FramePayload::Frag(frag),
                asn,
            ))],
            None => vec![Effect::Dropped(crate::error::DropReason::NoRoute)],
        }
    }
}

fn on_eb_received(ctx: &mut SimContext, receiver: NodeId, asn: Asn) -> Vec<Effect> {
    let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
    let was_synced = node.synced;
    node.join_on_eb();
    node.synced = true;
    if was_synced || node.is_root {
        return Vec::new();
    }
    if ctx.config.with_join {
        let delay = jittered_slots(ctx, receiver, ctx.config.join_attempt_timeout.max(ctx.config.slot_duration), 0.2, RngStream::Broadcast);
        vec![Effect::Schedule {
            delay,
            priority: scheduler::PRIO_APP_JOIN,
            tag: Some(periodic_tag(receiver, KIND_JOIN_RETRY)),
            event: SelfEvent::JoinRetry,
        }]
    } else {
        Vec::new()
    }
}

fn on_dio_received(ctx: &mut SimContext, receiver: NodeId, sender: NodeId, dio: DioPayload, asn: Asn) -> Vec<Effect> {
    if ctx.nodes.get(&receiver).map(|n| n.is_root).unwrap_or(true) {
        return Vec::new();
    }
    if let Some(node) = ctx.nodes.get_mut(&receiver) {
        node.rpl_on_dio(sender, &dio);
    }
    let had_parent_before = ctx.nodes.get(&receiver).map(|n| n.rpl.has_ever_had_parent).unwrap_or(false);

    // Cross-node loop detection reads a cheap snapshot of every node's
    // current preferred parent rather than handing `Node` a live reference
    // into the arena (spec §9).
    let parents: HashMap<NodeId, NodeId> = ctx
        .nodes
        .iter()
        .filter_map(|(&id, n)| n.rpl.preferred_parent.map(|p| (id, p)))
        .collect();

    let changed = {
        let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
        node.rpl_housekeeping(|n| parents.get(&n).copied())
    };

    if changed.is_none() {
        return Vec::new();
    }
    let old_parent = ctx.nodes.get(&receiver).and_then(|n| n.rpl.previous_preferred_parent);

    // Keep this node's own DIO advertising its (now-defined) rank, whether
    // this is its first-ever parent or a later churn.
    arm_periodic_ctx(ctx, receiver, KIND_DIO, 0, scheduler::PRIO_BROADCAST_TX, SelfEvent::SendDio);

    let is_first_ever = !had_parent_before;
    if is_first_ever && ctx.config.with_join {
        // Join gates the remaining stack; MSF bootstrap is deferred until
        // the token exchange completes (spec §4.5 step 4, §4.7).
    } else {
        begin_parent_change(ctx, receiver, old_parent, asn);
        if !ctx.config.with_join {
            start_remaining_stack(ctx, receiver, asn);
        }
    }
    check_termination(ctx, asn);
    Vec::new()
}

/// Once every non-root node has converged (joined, if join is enabled;
/// otherwise has ever acquired a preferred parent), let the run continue for
/// `numCyclesPerRun` more slotframes before periodic events stop re-arming
/// (spec §4.7).
fn check_termination(ctx: &mut SimContext, asn: Asn) {
    if ctx.terminate_at.is_some() {
        return;
    }
    let converged = if ctx.config.with_join {
        ctx.nodes.values().all(|n| n.is_root || n.join.is_joined())
    } else {
        ctx.nodes.values().all(|n| n.is_root || n.rpl.has_ever_had_parent)
    };
    if converged {
        let horizon = ctx.config.num_cycles_per_run as u64 * ctx.config.slotframe_length as u64;
        ctx.terminate_at = Some(asn + horizon);
    }
}

fn on_dao_received(ctx: &mut SimContext, receiver: NodeId, dao: DaoPayload, asn: Asn) -> Vec<Effect> {
    if receiver == ctx.root {
        if let Some(node) = ctx.nodes.get_mut(&receiver) {
            node.rpl_on_dao(dao.reporter, dao.parent);
        }
        return Vec::new();
    }
    let Some(parent) = ctx.nodes.get(&receiver).and_then(|n| n.rpl.preferred_parent) else {
        return vec![Effect::Dropped(crate::error::DropReason::NoRoute)];
    };
    vec![Effect::Enqueue(make_packet(receiver, Peer::Unicast(ctx.root), Some(parent), FramePayload::Dao(dao), asn))]
}

/// Join token exchange (spec §4.7). The packet's `source_route` accumulates
/// the upward path so the root can address its reply hop-by-hop back down
/// the same chain without a separately-maintained routing table entry.
/// Direction in flight is read off `destination` (still `root` while heading
/// up, `originator` once the root has turned the reply around) rather than
/// inferred from route contents, which degenerates to a single-element
/// route on both the first upward hop and the last downward hop.
fn on_join_received(
    ctx: &mut SimContext,
    receiver: NodeId,
    originator: NodeId,
    destination: Peer,
    mut route_so_far: Vec<NodeId>,
    payload: JoinPayload,
    asn: Asn,
) -> Vec<Effect> {
    if destination == Peer::Unicast(receiver) {
        // Downward reply reached its destination.
        let Some(node) = ctx.nodes.get_mut(&receiver) else { return Vec::new() };
        let just_joined = node.join.on_token_reply(payload.token);
        if just_joined {
            start_remaining_stack(ctx, receiver, asn);
            let old_parent = ctx.nodes.get(&receiver).and_then(|n| n.rpl.previous_preferred_parent);
            begin_parent_change(ctx, receiver, old_parent, asn);
            check_termination(ctx, asn);
        }
        return Vec::new();
    }

    if receiver == ctx.root {
        // Root replies: reverse the accumulated path and address the
        // response back to `originator` one hop at a time.
        route_so_far.reverse();
        if route_so_far.is_empty() {
            return Vec::new();
        }
        let next_hop = route_so_far.remove(0);
        let reply = Packet {
            enqueue_asn: asn,
            payload: FramePayload::Join(JoinPayload { token: payload.token.saturating_sub(1) }),
            retries_left: TSCH_MAXTXRETRIES,
            source: ctx.root,
            destination: Peer::Unicast(originator),
            source_route: route_so_far,
            next_hop: Some(next_hop),
        };
        return vec![Effect::Enqueue(reply)];
    }

    let heading_up = destination == Peer::Unicast(ctx.root);
    if heading_up {
        let Some(parent) = ctx.nodes.get(&receiver).and_then(|n| n.rpl.preferred_parent) else {
            return Vec::new();
        };
        route_so_far.push(receiver);
        vec![Effect::Enqueue(Packet {
            enqueue_asn: asn,
            payload: FramePayload::Join(payload),
            retries_left: TSCH_MAXTXRETRIES,
            source: originator,
            destination,
            source_route: route_so_far,
            next_hop: Some(parent),
        })]
    } else {
        if route_so_far.is_empty() {
            return Vec::new();
        }
        let next_hop = route_so_far.remove(0);
        vec![Effect::Enqueue(Packet {
            enqueue_asn: asn,
            payload: FramePayload::Join(payload),
            retries_left: TSCH_MAXTXRETRIES,
            source: originator,
            destination,
            source_route: route_so_far,
            next_hop: Some(next_hop),
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ilp::NullIlpImporter;
    use crate::collaborators::modulation::SimpleModulation;
    use crate::collaborators::statistics::NullStatistics;
    use crate::collaborators::topology::LogDistanceTopology;

    fn two_node_config() -> Config {
        let mut cfg = Config::default();
        cfg.num_nodes = 2;
        cfg.with_join = false;
        cfg.slotframe_length = 101;
        cfg.dio_period = 5.0;
        cfg.dao_period = 10.0;
        cfg.pk_period = 30.0;
        cfg.seed = 0;
        cfg
    }

    #[test]
    fn two_node_line_converges_and_delivers() {
        let cfg = two_node_config();
        let topo = Box::new(LogDistanceTopology::default().with_seed(0));
        let modulation = Box::new(SimpleModulation::new());
        let mut sim = Simulation::new(cfg, topo, modulation, Box::new(NullIlpImporter), Box::new(NullStatistics));
        sim.run_for(600_000);
        let child = sim.ctx().nodes.get(&1).unwrap();
        assert!(child.rpl.preferred_parent == Some(0));
        assert!(!child.schedule.cells_to_peer(0, None).is_empty());
        assert!(sim.ctx().packets_delivered_total >= 1);
    }
}
