//! Statistics collaborator (spec §1, §6): `getMoteStats()`/`getCellStats()`.

use std::collections::HashMap;

use serde::Serialize;

use crate::time::Asn;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MoteStats {
    pub rank: u32,
    pub dropped_no_route: u32,
    pub dropped_no_tx_cells: u32,
    pub dropped_queue_full: u32,
    pub dropped_mac_retries: u32,
    pub dropped_frag_failed_enqueue: u32,
    pub dropped_frag_vrb_table_full: u32,
    pub dropped_frag_reass_queue_full: u32,
    pub dropped_frag_missing_frag: u32,
    pub packets_generated: u32,
    pub packets_delivered_to_root: u32,
    pub charge_tx: u64,
    pub charge_rx: u64,
    pub charge_idle_listen: u64,
    pub charge_sleep: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CellStats {
    pub num_tx: u32,
    pub num_tx_ack: u32,
    pub num_rx: u32,
}

/// Receives per-cycle counters from the engine (spec §6).
pub trait Statistics {
    fn on_mote_stats(&mut self, asn: Asn, node_id: u32, stats: MoteStats);
    fn on_cell_stats(&mut self, asn: Asn, node_id: u32, timeslot: u16, channel: u8, stats: CellStats);
}

/// Discards everything; useful for tests that only assert on `Node` state.
#[derive(Debug, Default)]
pub struct NullStatistics;

impl Statistics for NullStatistics {
    fn on_mote_stats(&mut self, _asn: Asn, _node_id: u32, _stats: MoteStats) {}
    fn on_cell_stats(&mut self, _asn: Asn, _node_id: u32, _timeslot: u16, _channel: u8, _stats: CellStats) {}
}

/// Accumulates the latest snapshot per node, serializable as the CLI's
/// final JSON dump.
#[derive(Debug, Default, Serialize)]
pub struct JsonStatistics {
    pub mote_stats: HashMap<u32, MoteStats>,
    #[serde(skip)]
    pub cell_stats: HashMap<(u32, u16, u8), CellStats>,
}

impl Statistics for JsonStatistics {
    fn on_mote_stats(&mut self, _asn: Asn, node_id: u32, stats: MoteStats) {
        self.mote_stats.insert(node_id, stats);
    }

    fn on_cell_stats(&mut self, _asn: Asn, node_id: u32, timeslot: u16, channel: u8, stats: CellStats) {
        self.cell_stats.insert((node_id, timeslot, channel), stats);
    }
}
