//! Error taxonomy for the simulation core.
//!
//! Two kinds of failure exist in this engine (spec §7):
//!
//! - [`DropReason`]: a recoverable, *counted* outcome. Resources touched by
//!   the failed operation (blocked cells, timers, queue slots) are always
//!   released by the caller before the reason is recorded; a `DropReason`
//!   never unwinds past the layer that produced it.
//! - [`EngineError`]: an invariant violation. These are bugs, not protocol
//!   outcomes, and are the only errors allowed to propagate out of
//!   [`crate::engine::Simulation::run`].

use std::fmt;

use crate::time::Asn;

/// Why a frame, fragment or transaction was dropped. Each variant backs a
/// named counter surfaced through [`crate::collaborators::Statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No route (source route unknown, or neighbor not reachable).
    NoRoute,
    /// Node has no next-hop, or no TX/SHARED cell to that next-hop.
    NoTxCells,
    /// TSCH TX queue was at capacity and this frame type had no spare slot.
    QueueFull,
    /// `retriesLeft` reached zero.
    MacRetries,
    /// A fragment could not be appended to the TX queue.
    FragFailedEnqueue,
    /// The Virtual Reassembly Buffer had no free entry.
    FragVRBTableFull,
    /// The reassembly queue had no free entry.
    FragReassQueueFull,
    /// A fragment arrived out of order and `kill_entry_by_missing` fired.
    FragMissingFrag,
}

impl DropReason {
    /// Stable counter name, as exposed to `Statistics::getMoteStats()`.
    pub fn counter_name(self) -> &'static str {
        match self {
            DropReason::NoRoute => "droppedNoRoute",
            DropReason::NoTxCells => "droppedNoTxCells",
            DropReason::QueueFull => "droppedQueueFull",
            DropReason::MacRetries => "droppedMacRetries",
            DropReason::FragFailedEnqueue => "droppedFragFailedEnqueue",
            DropReason::FragVRBTableFull => "droppedFragVRBTableFull",
            DropReason::FragReassQueueFull => "droppedFragReassQueueFull",
            DropReason::FragMissingFrag => "droppedFragMissingFrag",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.counter_name())
    }
}

/// An invariant violation. Abort-worthy: the simulation cannot continue in a
/// meaningful state once one of these fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An event was scheduled at or before the current ASN, or a multi-slot
    /// modulation span would straddle the slotframe boundary.
    InvalidSchedule { asn: Asn, detail: String },
    /// Two cells were assigned the same `(timeslot, node)` pair.
    CellCollision { node: u32, timeslot: u16 },
    /// A cell references a modulation code not present in the active config.
    UnknownModulation { mcs: u8 },
    /// A timeslot was consumed twice in the same scheduling operation.
    DoubleConsumedTimeslot { node: u32, timeslot: u16 },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidSchedule { asn, detail } => {
                write!(f, "invalid schedule at ASN {asn}: {detail}")
            }
            EngineError::CellCollision { node, timeslot } => {
                write!(f, "cell collision: node {node} timeslot {timeslot}")
            }
            EngineError::UnknownModulation { mcs } => write!(f, "unknown modulation code {mcs}"),
            EngineError::DoubleConsumedTimeslot { node, timeslot } => {
                write!(f, "timeslot {timeslot} double-consumed on node {node}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
