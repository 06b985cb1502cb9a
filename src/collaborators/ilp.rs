//! ILP-offline schedule importer collaborator (spec §1, §6), used only when
//! `sf = ilp`.

use crate::collaborators::modulation::Mcs;
use crate::packet::{NodeId, Peer};

#[derive(Debug, Clone, Copy)]
pub enum CellDirection {
    Tx,
    Rx,
    Shared,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportedCell {
    pub timeslot: u16,
    pub channel: u8,
    pub direction: CellDirection,
    pub peer: Peer,
    pub mcs: Mcs,
    pub slots: u8,
}

/// Supplies a full schedule per node at bootstrap (spec §6).
pub trait IlpImporter {
    fn import(&self, node: NodeId) -> Vec<ImportedCell>;
}

/// No import available; `sf = ilp` falls back to an empty schedule, which
/// leaves the node with only its bootstrap minimal cells.
#[derive(Debug, Default)]
pub struct NullIlpImporter;

impl IlpImporter for NullIlpImporter {
    fn import(&self, _node: NodeId) -> Vec<ImportedCell> {
        Vec::new()
    }
}
