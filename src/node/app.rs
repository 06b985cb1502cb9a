//! Application traffic generator, fragmentation, reassembly and the
//! Virtual Reassembly Buffer (spec §3, §4.8).

use std::collections::HashMap;

use crate::packet::{DataPayload, FragPayload, NodeId};
use crate::time::Asn;

/// Key for both the reassembly queue and the VRB (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatagramKey {
    pub source_mac: NodeId,
    pub tag: u16,
}

#[derive(Debug, Clone)]
pub struct ReassemblyEntry {
    pub last_seen_asn: Asn,
    pub received_offsets: Vec<u8>,
    pub num_fragments: u8,
    pub payload: DataPayload,
}

#[derive(Debug, Clone)]
pub struct VrbEntry {
    pub last_seen_asn: Asn,
    pub out_tag: u16,
    pub next_expected_offset: Option<u8>,
}

/// Reassembly queue (destination-side) and VRB (relay-side forwarding
/// table), both bounded and GC'd after 60s of inactivity (spec §3, §4.8).
#[derive(Debug, Default)]
pub struct FragmentationState {
    pub reassembly: HashMap<DatagramKey, ReassemblyEntry>,
    pub vrb: HashMap<DatagramKey, VrbEntry>,
    pub next_tag: u16,
}

pub enum ReassemblyOutcome {
    /// The datagram is not yet complete; fragment accepted.
    Pending,
    /// All fragments received; the reassembled payload is returned.
    Complete(DataPayload),
    /// An out-of-order arrival triggered `kill_entry_by_missing`: the entry
    /// was deleted and this fragment (and any future ones for the same
    /// datagram) must be dropped as `FragMissingFrag`.
    KilledByMissing,
    /// The reassembly queue has no free slot for a new datagram.
    QueueFull,
}

impl FragmentationState {
    pub fn new() -> Self {
        FragmentationState::default()
    }

    fn expire(&mut self, now: Asn, slot_duration_secs: f64) {
        let expiry_slots = (crate::config::FRAG_ENTRY_EXPIRY_SECS as f64 / slot_duration_secs).ceil() as u64;
        self.reassembly
            .retain(|_, e| now.saturating_sub(e.last_seen_asn) <= expiry_slots);
        self.vrb.retain(|_, e| now.saturating_sub(e.last_seen_asn) <= expiry_slots);
    }

    /// Split a DATA payload into `num_fragments` FRAG frames sharing one
    /// datagram tag (spec §4.8).
    pub fn fragment(&mut self, data: DataPayload, num_fragments: u8) -> Vec<FragPayload> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        (0..num_fragments)
            .map(|offset| FragPayload {
                tag,
                offset,
                num_fragments,
                data: data.clone(),
            })
            .collect()
    }

    /// Accept an incoming fragment at the destination node (spec §4.8,
    /// §3's "kill_entry_by_missing option").
    pub fn on_fragment_received(
        &mut self,
        source_mac: NodeId,
        frag: &FragPayload,
        now: Asn,
        slot_duration_secs: f64,
        max_queue: usize,
        kill_entry_by_missing: bool,
    ) -> ReassemblyOutcome {
        self.expire(now, slot_duration_secs);
        let key = DatagramKey { source_mac, tag: frag.tag };

        if !self.reassembly.contains_key(&key) {
            if frag.offset != 0 && kill_entry_by_missing {
                return ReassemblyOutcome::KilledByMissing;
            }
            if self.reassembly.len() >= max_queue {
                return ReassemblyOutcome::QueueFull;
            }
            self.reassembly.insert(
                key,
                ReassemblyEntry {
                    last_seen_asn: now,
                    received_offsets: Vec::new(),
                    num_fragments: frag.num_fragments,
                    payload: frag.data.clone(),
                },
            );
        }

        let entry = self.reassembly.get_mut(&key).unwrap();
        let expected_next = entry.received_offsets.len() as u8;
        if kill_entry_by_missing && frag.offset != expected_next {
            self.reassembly.remove(&key);
            return ReassemblyOutcome::KilledByMissing;
        }

        entry.last_seen_asn = now;
        if !entry.received_offsets.contains(&frag.offset) {
            entry.received_offsets.push(frag.offset);
        }
        if entry.received_offsets.len() as u8 >= entry.num_fragments {
            let payload = entry.payload.clone();
            self.reassembly.remove(&key);
            ReassemblyOutcome::Complete(payload)
        } else {
            ReassemblyOutcome::Pending
        }
    }

    /// Relay-side VRB lookup/creation when `enableFragmentForwarding` is set
    /// (spec §3, §4.8).
    pub fn vrb_forward(
        &mut self,
        source_mac: NodeId,
        frag: &FragPayload,
        now: Asn,
        slot_duration_secs: f64,
        max_entries: usize,
        kill_entry_by_missing: bool,
    ) -> Result<u16, crate::error::DropReason> {
        self.expire(now, slot_duration_secs);
        let key = DatagramKey { source_mac, tag: frag.tag };

        if !self.vrb.contains_key(&key) {
            if frag.offset != 0 && kill_entry_by_missing {
                return Err(crate::error::DropReason::FragMissingFrag);
            }
            if self.vrb.len() >= max_entries {
                return Err(crate::error::DropReason::FragVRBTableFull);
            }
            let out_tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            self.vrb.insert(
                key,
                VrbEntry {
                    last_seen_asn: now,
                    out_tag,
                    next_expected_offset: Some(0),
                },
            );
        }

        let entry = self.vrb.get_mut(&key).unwrap();
        if kill_entry_by_missing {
            if entry.next_expected_offset != Some(frag.offset) {
                self.vrb.remove(&key);
                return Err(crate::error::DropReason::FragMissingFrag);
            }
            entry.next_expected_offset = Some(frag.offset + 1);
        }
        entry.last_seen_asn = now;
        let out_tag = entry.out_tag;
        if frag.offset + 1 == frag.num_fragments {
            self.vrb.remove(&key);
        }
        Ok(out_tag)
    }
}

/// Whether a periodic data generation tick should fire: `pkPeriod * (1 +-
/// pkPeriodVar)` seconds have elapsed since the last generation, expressed
/// in slots (spec §4.8).
pub fn next_generation_delay_slots(
    pk_period_secs: f64,
    pk_period_var: f64,
    slot_duration_secs: f64,
    mut rng: impl rand::Rng,
) -> u64 {
    let jitter = rng.gen_range(-pk_period_var..=pk_period_var);
    let period = (pk_period_secs * (1.0 + jitter)).max(slot_duration_secs);
    (period / slot_duration_secs).round().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRAG_ENTRY_EXPIRY_SECS;

    fn data() -> DataPayload {
        DataPayload {
            source: 1,
            enqueue_asn: Asn::ZERO,
            hop_count: 1,
        }
    }

    #[test]
    fn fragments_share_a_tag() {
        let mut frag_state = FragmentationState::new();
        let frags = frag_state.fragment(data(), 4);
        assert_eq!(frags.len(), 4);
        assert!(frags.iter().all(|f| f.tag == frags[0].tag));
        assert_eq!(frags.iter().map(|f| f.offset).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reassembly_completes_in_order() {
        let mut frag_state = FragmentationState::new();
        let frags = frag_state.fragment(data(), 2);
        let outcome1 = frag_state.on_fragment_received(1, &frags[0], Asn(0), 0.01, 4, true);
        assert!(matches!(outcome1, ReassemblyOutcome::Pending));
        let outcome2 = frag_state.on_fragment_received(1, &frags[1], Asn(1), 0.01, 4, true);
        assert!(matches!(outcome2, ReassemblyOutcome::Complete(_)));
    }

    #[test]
    fn out_of_order_kills_entry_with_missing_option() {
        // spec §8 scenario 6: offsets [0,1,3] with kill_entry_by_missing.
        let mut frag_state = FragmentationState::new();
        let frags = frag_state.fragment(data(), 4);
        assert!(matches!(
            frag_state.on_fragment_received(1, &frags[0], Asn(0), 0.01, 4, true),
            ReassemblyOutcome::Pending
        ));
        assert!(matches!(
            frag_state.on_fragment_received(1, &frags[1], Asn(1), 0.01, 4, true),
            ReassemblyOutcome::Pending
        ));
        let outcome = frag_state.on_fragment_received(1, &frags[3], Asn(2), 0.01, 4, true);
        assert!(matches!(outcome, ReassemblyOutcome::KilledByMissing));
        assert!(frag_state.reassembly.is_empty());
    }

    #[test]
    fn entries_expire_after_60_seconds() {
        let mut frag_state = FragmentationState::new();
        let frags = frag_state.fragment(data(), 2);
        frag_state.on_fragment_received(1, &frags[0], Asn(0), 1.0, 4, true);
        assert_eq!(frag_state.reassembly.len(), 1);
        frag_state.expire(Asn(FRAG_ENTRY_EXPIRY_SECS + 1), 1.0);
        assert!(frag_state.reassembly.is_empty());
    }
}
