//! Frame types and the unified packet envelope (spec §3, §9).
//!
//! Spec §9 calls out the source's "heterogeneous packet payload (positional
//! list indexing)" as an anti-pattern to replace with per-type structs and a
//! sum type; `FramePayload` is that sum type.

use crate::time::Asn;

pub type NodeId = u32;

/// Replaces duck-typed "neighbor: node-or-list" with a tagged variant
/// (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Unicast(NodeId),
    Broadcast,
}

impl Peer {
    pub fn node_id(self) -> Option<NodeId> {
        match self {
            Peer::Unicast(id) => Some(id),
            Peer::Broadcast => None,
        }
    }
}

/// 6P return codes (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SixpReturnCode {
    Success,
    NoResources,
    Busy,
    Reset,
}

/// 6P operation carried by `FramePayload::SixpRequest`/`SixpResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SixpOp {
    Add,
    Delete,
}

/// A single candidate or granted cell, as carried in a 6P cell list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSpec {
    pub timeslot: u16,
    pub channel: u8,
    /// Modulation/coding scheme this cell (and, under `individualModulations`,
    /// its `slots - 1` successor placeholders) is negotiated at (spec §4.3,
    /// §4.4, §6).
    pub mcs: u8,
}

#[derive(Debug, Clone)]
pub struct SixpRequestPayload {
    pub op: SixpOp,
    pub cell_list: Vec<CellSpec>,
    pub num_cells: u8,
    /// Initiator's current transaction sequence number, echoed back on the
    /// matching response; lets the initiator reject stale/mismatched
    /// responses (spec §4.4).
    pub seq: u8,
}

#[derive(Debug, Clone)]
pub struct SixpResponsePayload {
    pub op: SixpOp,
    pub code: SixpReturnCode,
    pub cell_list: Vec<CellSpec>,
    pub seq: u8,
}

#[derive(Debug, Clone)]
pub struct DioPayload {
    pub rank: u32,
}

#[derive(Debug, Clone)]
pub struct DaoPayload {
    pub reporter: NodeId,
    pub parent: NodeId,
}

#[derive(Debug, Clone)]
pub struct JoinPayload {
    /// Remaining exchanges before the node is considered joined.
    pub token: u8,
}

#[derive(Debug, Clone)]
pub struct DataPayload {
    pub source: NodeId,
    pub enqueue_asn: Asn,
    pub hop_count: u16,
}

#[derive(Debug, Clone)]
pub struct FragPayload {
    pub tag: u16,
    pub offset: u8,
    pub num_fragments: u8,
    pub data: DataPayload,
}

/// Per-type frame bodies (spec §9: replace heterogeneous payload indexing
/// with a sum type).
#[derive(Debug, Clone)]
pub enum FramePayload {
    Data(DataPayload),
    Frag(FragPayload),
    Ack,
    Join(JoinPayload),
    Dio(DioPayload),
    Dao(DaoPayload),
    Eb,
    SixpRequest(SixpRequestPayload),
    SixpResponse(SixpResponsePayload),
}

impl FramePayload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::Data(_) => FrameType::Data,
            FramePayload::Frag(_) => FrameType::Frag,
            FramePayload::Ack => FrameType::Ack,
            FramePayload::Join(_) => FrameType::Join,
            FramePayload::Dio(_) => FrameType::Dio,
            FramePayload::Dao(_) => FrameType::Dao,
            FramePayload::Eb => FrameType::Eb,
            FramePayload::SixpRequest(_) => FrameType::SixpRequest,
            FramePayload::SixpResponse(_) => FrameType::SixpResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Ack,
    Join,
    Frag,
    Dio,
    Dao,
    Eb,
    SixpRequest,
    SixpResponse,
}

impl FrameType {
    /// Control-plane frame types get one extra queue slot when the queue is
    /// full (spec §4.3).
    pub fn is_control(self) -> bool {
        matches!(
            self,
            FrameType::Join | FrameType::Dao | FrameType::SixpRequest | FrameType::SixpResponse
        )
    }
}

/// A single queued/in-flight frame (spec §3).
#[derive(Debug, Clone)]
pub struct Packet {
    pub enqueue_asn: Asn,
    pub payload: FramePayload,
    pub retries_left: u8,
    pub source: NodeId,
    pub destination: Peer,
    /// Explicit downward source route, consumed hop by hop; empty for
    /// upward/local traffic.
    pub source_route: Vec<NodeId>,
    /// Resolved at TX time from `destination`/`source_route`.
    pub next_hop: Option<NodeId>,
}

impl Packet {
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }
}
