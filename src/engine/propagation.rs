//! Propagation coordinator (spec §4.2): resolves, for one ASN, which
//! transmissions are heard by which listeners and with what outcome.
//!
//! Invoked once per ASN after every node has registered its active-cell
//! intent (spec §4.2's "invoked once per ASN after all nodes have
//! registered their slot activity"), rather than once per node — real
//! TSCH slots are lockstep across the whole network.

use std::collections::HashMap;

use rand::Rng;

use crate::collaborators::modulation::{Mcs, Modulation};
use crate::engine::simulator::SimContext;
use crate::node::{ActiveCellDecision, Effect};
use crate::packet::{NodeId, Packet, Peer};
use crate::time::Asn;

struct TxIntent {
    node: NodeId,
    ts: u16,
    channel: u8,
    mcs: Mcs,
    packet: Packet,
    is_final_slot: bool,
}

struct RxIntent {
    node: NodeId,
    channel: u8,
    ts: u16,
}

/// Run the active-cell slot for `asn`: collect every node's intent, resolve
/// the channel contention, deliver/ack/drop frames, and feed the resulting
/// [`Effect`]s back into each node (spec §4.2, §4.3).
pub fn run_slot(ctx: &mut SimContext, asn: Asn) {
    let slotframe_length = ctx.config.slotframe_length;
    let node_ids: Vec<NodeId> = ctx.nodes.keys().copied().collect();
    let profile = ctx.config.modulation_config.profile.clone();

    let mut tx_intents: Vec<TxIntent> = Vec::new();
    let mut rx_intents: Vec<RxIntent> = Vec::new();

    for id in &node_ids {
        let modulation = &ctx.modulation;
        let slots_for = |mcs: Mcs| modulation.slots(&profile, mcs);
        let node = ctx.nodes.get_mut(id).expect("node present in arena");
        if let Some((ts, decision)) = node.decide_active_cell(asn, slotframe_length, slots_for) {
            match decision {
                ActiveCellDecision::Tx { channel, mcs, packet, is_final_slot } => {
                    node.energy.charge_tx(true);
                    tx_intents.push(TxIntent { node: *id, ts, channel, mcs, packet: *packet, is_final_slot });
                }
                ActiveCellDecision::Rx { channel } => {
                    node.energy.charge_rx(true);
                    rx_intents.push(RxIntent { node: *id, channel, ts });
                }
                ActiveCellDecision::IdleListen => {
                    node.energy.charge_idle_listen();
                }
            }
        } else {
            node.energy.charge_sleep();
        }
    }

    if tx_intents.is_empty() && rx_intents.is_empty() {
        return;
    }

    let mut by_channel: HashMap<u8, Vec<usize>> = HashMap::new();
    for (i, tx) in tx_intents.iter().enumerate() {
        by_channel.entry(tx.channel).or_default().push(i);
    }

    // Per listener, find the strongest transmitter on its channel whose
    // frame is actually addressed to it (unicast to this node, or
    // broadcast), then draw a single Bernoulli success against that link's
    // interference-aware PDR: spec §4.2 step 2 treats every other
    // simultaneous transmission on the same channel as interference, and
    // step 3 feeds this one draw back as both `radio_rxDone` and the
    // sender's ACK/NACK, rather than drawing twice.
    let mut slot_success: HashMap<(NodeId, NodeId), bool> = HashMap::new();
    for rx in &rx_intents {
        let Some(candidate_idxs) = by_channel.get(&rx.channel) else { continue };
        let best = candidate_idxs
            .iter()
            .filter(|&&i| {
                let tx = &tx_intents[i];
                match tx.packet.destination {
                    Peer::Broadcast => true,
                    Peer::Unicast(_) => tx.packet.next_hop == Some(rx.node),
                }
            })
            .max_by(|&&a, &&b| {
                let ra = ctx.topology.rssi(tx_intents[a].node, rx.node);
                let rb = ctx.topology.rssi(tx_intents[b].node, rx.node);
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied();

        let Some(winner) = best else { continue };
        let tx_node_id = tx_intents[winner].node;
        let rssi = ctx.topology.rssi(tx_node_id, rx.node);
        let mcs = tx_intents[winner].mcs;
        let interferers_rssi: Vec<f32> = candidate_idxs
            .iter()
            .filter(|&&i| i != winner)
            .map(|&i| ctx.topology.rssi(tx_intents[i].node, rx.node))
            .collect();
        let pdr = ctx.topology.rssi_to_pdr_with_interference(rssi, &interferers_rssi, mcs);
        let mut rng = crate::rng::channel_rng(ctx.config.seed, tx_node_id, rx.node, asn);
        let success = rng.gen::<f32>() < pdr;

        slot_success.insert((tx_node_id, rx.node), success);
        if success && matches!(tx_intents[winner].packet.destination, Peer::Broadcast) {
            let packet = tx_intents[winner].packet.clone();
            deliver(ctx, rx.node, tx_node_id, packet, asn);
        }
        record_cell_stats(ctx, asn, rx.node, rx.ts, rx.channel, success);
    }

    for tx in tx_intents {
        let peer = tx.packet.destination;
        let success_this_slot = match peer {
            Peer::Broadcast => false,
            Peer::Unicast(to) => slot_success.get(&(tx.node, to)).copied().unwrap_or(false),
        };
        let is_broadcast = matches!(peer, Peer::Broadcast);

        let node = ctx.nodes.get_mut(&tx.node).expect("node present in arena");
        let combined = node.note_multi_slot_tx_slot(success_this_slot, tx.is_final_slot);
        let Some(acked) = combined else {
            // Mid-span: the frame's outcome isn't decided yet, so no
            // delivery, retry, or 6P senddone handling happens until the
            // final constituent slot resolves (spec §4.2 step 4).
            continue;
        };

        if acked && !is_broadcast {
            if let Peer::Unicast(to) = peer {
                let packet = tx.packet.clone();
                deliver(ctx, to, tx.node, packet, asn);
            }
        }

        let msf_max = ctx.config.msf_max_num_cells as u32;
        let node = ctx.nodes.get_mut(&tx.node).expect("node present in arena");
        let effects = node.on_tx_outcome(tx.ts, peer, acked, is_broadcast, msf_max);
        apply_effects(ctx, tx.node, effects);

        // The TX senddone ACK of a 6P request/response is itself a protocol
        // event: arm the initiator's response timeout, or let the responder
        // install/remove the cells it just granted (spec §4.4 step 3, "on
        // response senddone").
        if acked {
            if let Peer::Unicast(neighbor) = peer {
                match &tx.packet.payload {
                    crate::packet::FramePayload::SixpRequest(_) => {
                        let timeout = crate::node::msf::compute_sixtop_timeout(
                            ctx.config.slotframe_length,
                            ctx.config.slot_duration,
                            ctx.nodes[&tx.node].schedule.cells_to_peer(neighbor, Some(crate::node::schedule::CellDirection::Tx)).len() as u32,
                            ctx.nodes[&tx.node].mean_cell_pdr_to(neighbor),
                            1.0,
                            ctx.config.msf_default_sixtop_timeout,
                        );
                        let node = ctx.nodes.get_mut(&tx.node).expect("node present in arena");
                        let effects = node.sixtop_on_request_senddone(neighbor, timeout as u64);
                        apply_effects(ctx, tx.node, effects);
                    }
                    crate::packet::FramePayload::SixpResponse(_) => {
                        let profile = ctx.config.modulation_config.profile.clone();
                        let slotframe_length = ctx.config.slotframe_length;
                        let modulation = &ctx.modulation;
                        let slots_for = |mcs: u8| modulation.slots(&profile, mcs);
                        let node = ctx.nodes.get_mut(&tx.node).expect("node present in arena");
                        node.sixtop_on_response_senddone(neighbor, slots_for, slotframe_length);
                    }
                    _ => {}
                }
            }
        }

        if !is_broadcast && !acked {
            if let Some(node) = ctx.nodes.get_mut(&tx.node) {
                let effects = node.on_unicast_unacked(tx.packet);
                apply_effects(ctx, tx.node, effects);
            }
        }
    }
}

fn record_cell_stats(ctx: &mut SimContext, asn: Asn, node: NodeId, ts: u16, channel: u8, acked: bool) {
    use crate::collaborators::statistics::CellStats;
    let stats = CellStats { num_tx: 0, num_tx_ack: if acked { 1 } else { 0 }, num_rx: 1 };
    ctx.statistics.on_cell_stats(asn, node, ts, channel, stats);
}

/// Hand a successfully-received frame to its destination's protocol demux
/// (spec §4.1, §4.4-§4.8).
fn deliver(ctx: &mut SimContext, receiver: NodeId, sender: NodeId, packet: Packet, asn: Asn) {
    let effects = crate::engine::simulator::demux_received(ctx, receiver, sender, packet, asn);
    apply_effects(ctx, receiver, effects);
}

/// Turn a node's [`Effect`]s into queue mutations, statistics and pending
/// scheduler requests (spec §9: the node layer never reaches into the
/// arena or scheduler directly).
pub fn apply_effects(ctx: &mut SimContext, node_id: NodeId, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Enqueue(pkt) => {
                if let Some(node) = ctx.nodes.get_mut(&node_id) {
                    if let Err(reason) = node.queue.enqueue(pkt) {
                        node.drop_counts.entry(reason.counter_name()).and_modify(|c| *c += 1).or_insert(1);
                    }
                }
            }
            Effect::Schedule { delay, priority, tag, event } => {
                ctx.pending_schedules.push(crate::engine::simulator::PendingSchedule {
                    delay,
                    priority,
                    tag,
                    kind: crate::engine::simulator::EventKind::NodeSelf { node: node_id, event },
                });
            }
            Effect::Cancel(tag) => ctx.pending_cancels.push(tag),
            Effect::Dropped(_) => {}
            Effect::Delivered { hop_count, latency_slots } => {
                ctx.delivered.push((node_id, hop_count, latency_slots));
            }
        }
    }
}
