//! Bounded TX queue with a control-plane overflow allowance (spec §4.3).

use std::collections::VecDeque;

use crate::config::TSCH_QUEUE_SIZE;
use crate::error::DropReason;
use crate::packet::{FrameType, NodeId, Packet};

#[derive(Debug, Default)]
pub struct TxQueue {
    frames: VecDeque<Packet>,
}

impl TxQueue {
    pub fn new() -> Self {
        TxQueue { frames: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Enqueue `pkt`, subject to spec §4.3's boundary rule: at `TSCH_QUEUE_SIZE`,
    /// control-plane frames (JOIN, DAO, 6P) get one extra slot per type so a
    /// congested queue never starves join/maintenance traffic.
    pub fn enqueue(&mut self, pkt: Packet) -> Result<(), DropReason> {
        if self.frames.len() < TSCH_QUEUE_SIZE {
            self.frames.push_back(pkt);
            return Ok(());
        }
        let ft = pkt.frame_type();
        if ft.is_control() {
            let already_spilled = self
                .frames
                .iter()
                .skip(TSCH_QUEUE_SIZE)
                .any(|p| p.frame_type() == ft);
            if !already_spilled {
                self.frames.push_back(pkt);
                return Ok(());
            }
        }
        Err(DropReason::QueueFull)
    }

    /// Find the first queued frame whose next-hop equals `peer` (spec
    /// §4.3's TX-direction dispatch rule) and remove it.
    pub fn take_for_next_hop(&mut self, peer: NodeId) -> Option<Packet> {
        let idx = self
            .frames
            .iter()
            .position(|p| p.next_hop == Some(peer))?;
        self.frames.remove(idx)
    }

    /// Find the first queued unicast frame destined to `peer` over a SHARED
    /// cell, without requiring `next_hop` to already be resolved.
    pub fn take_matching_peer(&mut self, peer: NodeId) -> Option<Packet> {
        let idx = self.frames.iter().position(|p| p.next_hop == Some(peer))?;
        self.frames.remove(idx)
    }

    /// Find the first queued broadcast-eligible control frame with no
    /// dedicated cell to its target (spec §4.3's SHARED-broadcast rule).
    pub fn take_broadcast_eligible(&mut self, has_dedicated_cell: impl Fn(NodeId) -> bool) -> Option<Packet> {
        let idx = self.frames.iter().position(|p| match p.frame_type() {
            FrameType::Join | FrameType::Dio | FrameType::Eb => true,
            FrameType::SixpRequest | FrameType::SixpResponse => match p.next_hop {
                Some(nh) => !has_dedicated_cell(nh),
                None => true,
            },
            _ => false,
        })?;
        self.frames.remove(idx)
    }

    pub fn push_front(&mut self, pkt: Packet) {
        self.frames.push_front(pkt);
    }

    /// Remove and return every frame matching `pred`; used when freeing 6P
    /// state on drop/reset so stale requests/responses don't linger.
    pub fn remove_matching(&mut self, pred: impl Fn(&Packet) -> bool) -> Vec<Packet> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.frames.len() {
            if pred(&self.frames[i]) {
                removed.push(self.frames.remove(i).unwrap());
            } else {
                i += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DataPayload, FramePayload, Peer};
    use crate::time::Asn;

    fn data_pkt(next_hop: Option<NodeId>) -> Packet {
        Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::Data(DataPayload {
                source: 1,
                enqueue_asn: Asn::ZERO,
                hop_count: 1,
            }),
            retries_left: 4,
            source: 1,
            destination: Peer::Unicast(2),
            source_route: Vec::new(),
            next_hop,
        }
    }

    fn join_pkt() -> Packet {
        Packet {
            enqueue_asn: Asn::ZERO,
            payload: FramePayload::Join(crate::packet::JoinPayload { token: 1 }),
            retries_left: 4,
            source: 1,
            destination: Peer::Broadcast,
            source_route: Vec::new(),
            next_hop: None,
        }
    }

    #[test]
    fn data_drops_when_full() {
        let mut q = TxQueue::new();
        for _ in 0..TSCH_QUEUE_SIZE {
            q.enqueue(data_pkt(Some(2))).unwrap();
        }
        assert!(matches!(q.enqueue(data_pkt(Some(2))), Err(DropReason::QueueFull)));
    }

    #[test]
    fn control_frame_gets_one_extra_slot() {
        let mut q = TxQueue::new();
        for _ in 0..TSCH_QUEUE_SIZE {
            q.enqueue(data_pkt(Some(2))).unwrap();
        }
        assert!(q.enqueue(join_pkt()).is_ok());
        assert!(matches!(q.enqueue(join_pkt()), Err(DropReason::QueueFull)));
    }
}
