//! Slotframe and cell table (spec §3, §4.3).

use std::collections::HashMap;

use crate::collaborators::modulation::Mcs;
use crate::config::NUM_MAX_HISTORY;
use crate::error::EngineError;
use crate::packet::{NodeId, Peer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDirection {
    Tx,
    Rx,
    Shared,
}

/// One history sample, capped at [`NUM_MAX_HISTORY`] entries per spec §9's
/// Open Question (history is unrelated to `NUM_SUFFICIENT_TX`, the ETX
/// threshold, and must not grow unboundedly).
#[derive(Debug, Clone, Copy)]
pub struct CellHistorySample {
    pub acked: bool,
}

/// A single scheduled cell (spec §3).
#[derive(Debug, Clone)]
pub struct Cell {
    pub timeslot: u16,
    pub channel: u8,
    pub direction: CellDirection,
    pub peer: Peer,
    pub num_tx: u32,
    pub num_tx_ack: u32,
    pub num_rx: u32,
    /// `Some(parent_ts)` when this slot is a placeholder occupancy of a
    /// multi-slot cell whose logic lives at `parent_ts`; `None` (or equal
    /// to `timeslot`) for the active slot itself.
    pub parent_slot: Option<u16>,
    pub modulation: Mcs,
    pub history: std::collections::VecDeque<CellHistorySample>,
}

impl Cell {
    fn new(timeslot: u16, channel: u8, direction: CellDirection, peer: Peer, modulation: Mcs) -> Self {
        Cell {
            timeslot,
            channel,
            direction,
            peer,
            num_tx: 0,
            num_tx_ack: 0,
            num_rx: 0,
            parent_slot: None,
            modulation,
            history: std::collections::VecDeque::new(),
        }
    }

    pub fn is_parent(&self) -> bool {
        self.parent_slot.is_none()
    }

    pub fn record(&mut self, acked: bool) {
        if self.history.len() >= NUM_MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(CellHistorySample { acked });
    }

    /// Observed PDR on this cell from recorded TX attempts; `None` until at
    /// least one sample exists.
    pub fn observed_pdr(&self) -> Option<f32> {
        if self.num_tx == 0 {
            None
        } else {
            Some(self.num_tx_ack as f32 / self.num_tx as f32)
        }
    }
}

/// Per-node schedule: at most one cell per timeslot (spec §3 invariant).
#[derive(Debug, Default)]
pub struct Schedule {
    cells: HashMap<u16, Cell>,
}

impl Schedule {
    pub fn new() -> Self {
        Schedule { cells: HashMap::new() }
    }

    pub fn get(&self, ts: u16) -> Option<&Cell> {
        self.cells.get(&ts)
    }

    pub fn get_mut(&mut self, ts: u16) -> Option<&mut Cell> {
        self.cells.get_mut(&ts)
    }

    pub fn occupied(&self, ts: u16) -> bool {
        self.cells.contains_key(&ts)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.values_mut()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Resolve the parent-slot cell backing `ts` (itself, if `ts` is a
    /// parent slot).
    pub fn parent_of(&self, ts: u16) -> Option<u16> {
        self.cells.get(&ts).map(|c| c.parent_slot.unwrap_or(ts))
    }

    /// Install a single-slot cell, asserting no collision (spec §3, §8).
    pub fn add_cell(
        &mut self,
        node_id: NodeId,
        timeslot: u16,
        channel: u8,
        direction: CellDirection,
        peer: Peer,
        modulation: Mcs,
    ) -> Result<(), EngineError> {
        if self.cells.contains_key(&timeslot) {
            return Err(EngineError::CellCollision { node: node_id, timeslot });
        }
        self.cells
            .insert(timeslot, Cell::new(timeslot, channel, direction, peer, modulation));
        Ok(())
    }

    /// Install a multi-slot cell spanning `parent_ts .. parent_ts + slots`.
    /// All occupied slots point to `parent_ts`; only `parent_ts` is active
    /// for dispatch logic (spec §3, §4.3).
    pub fn add_multi_slot_cell(
        &mut self,
        node_id: NodeId,
        parent_ts: u16,
        slots: u8,
        channel: u8,
        direction: CellDirection,
        peer: Peer,
        modulation: Mcs,
        slotframe_length: u16,
    ) -> Result<(), EngineError> {
        if parent_ts as u32 + slots as u32 > slotframe_length as u32 {
            return Err(EngineError::InvalidSchedule {
                asn: crate::time::Asn::ZERO,
                detail: format!(
                    "multi-slot cell at {parent_ts} (span {slots}) straddles slotframe boundary {slotframe_length}"
                ),
            });
        }
        for offset in 0..slots {
            let ts = parent_ts + offset as u16;
            if self.cells.contains_key(&ts) {
                return Err(EngineError::CellCollision { node: node_id, timeslot: ts });
            }
        }
        for offset in 0..slots {
            let ts = parent_ts + offset as u16;
            let mut cell = Cell::new(ts, channel, direction, peer, modulation);
            if ts != parent_ts {
                cell.parent_slot = Some(parent_ts);
            }
            self.cells.insert(ts, cell);
        }
        Ok(())
    }

    /// Remove the cell at `ts`; if it is a parent slot, all its placeholder
    /// occupancies are removed too (spec §3).
    pub fn remove_cell(&mut self, ts: u16) {
        let parent = self.cells.get(&ts).map(|c| c.parent_slot.unwrap_or(ts));
        let Some(parent) = parent else { return };
        let to_remove: Vec<u16> = self
            .cells
            .iter()
            .filter(|(_, c)| c.parent_slot.unwrap_or(c.timeslot) == parent)
            .map(|(ts, _)| *ts)
            .collect();
        for ts in to_remove {
            self.cells.remove(&ts);
        }
    }

    /// All timeslots (parent or placeholder) dedicated (TX or RX) to `peer`.
    pub fn cells_to_peer(&self, peer: NodeId, direction: Option<CellDirection>) -> Vec<u16> {
        self.cells
            .values()
            .filter(|c| c.peer == Peer::Unicast(peer))
            .filter(|c| direction.map(|d| c.direction == d).unwrap_or(true))
            .filter(|c| c.is_parent())
            .map(|c| c.timeslot)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_is_rejected() {
        let mut s = Schedule::new();
        s.add_cell(1, 5, 0, CellDirection::Tx, Peer::Unicast(2), 0).unwrap();
        let err = s.add_cell(1, 5, 1, CellDirection::Rx, Peer::Unicast(3), 0);
        assert!(matches!(err, Err(EngineError::CellCollision { .. })));
    }

    #[test]
    fn multi_slot_cell_propagates_parent() {
        let mut s = Schedule::new();
        s.add_multi_slot_cell(1, 10, 3, 0, CellDirection::Tx, Peer::Unicast(2), 2, 101)
            .unwrap();
        assert_eq!(s.parent_of(10), Some(10));
        assert_eq!(s.parent_of(11), Some(10));
        assert_eq!(s.parent_of(12), Some(10));
        assert!(s.get(11).unwrap().parent_slot == Some(10));
    }

    #[test]
    fn multi_slot_cell_straddling_boundary_is_rejected() {
        let mut s = Schedule::new();
        let err = s.add_multi_slot_cell(1, 100, 3, 0, CellDirection::Tx, Peer::Unicast(2), 2, 101);
        assert!(matches!(err, Err(EngineError::InvalidSchedule { .. })));
    }

    #[test]
    fn removing_parent_removes_placeholders() {
        let mut s = Schedule::new();
        s.add_multi_slot_cell(1, 10, 2, 0, CellDirection::Tx, Peer::Unicast(2), 2, 101)
            .unwrap();
        s.remove_cell(10);
        assert!(!s.occupied(10));
        assert!(!s.occupied(11));
    }
}
