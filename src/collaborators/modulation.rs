//! Modulation/bit-rate collaborator (spec §1, §6: "out of scope; only
//! interfaces specified here").

/// Modulation and Coding Scheme code, as stored on a cell (spec §3).
pub type Mcs = u8;

/// Provides the per-modulation slot span, the allowed set for a given
/// `modulationConfig` profile, and the minimal-cell MCS.
pub trait Modulation {
    /// Number of consecutive timeslots a frame at `mcs` occupies.
    fn slots(&self, profile: &str, mcs: Mcs) -> u8;
    /// MCS codes usable under `profile`.
    fn allowed(&self, profile: &str) -> &[Mcs];
    /// MCS used for minimal (bootstrap) shared cells under `profile`.
    fn minimal_cell_modulation(&self, profile: &str) -> Mcs;
}

/// Single-slot-per-frame reference table: every MCS occupies exactly one
/// timeslot, i.e. the non-multi-slot default path (spec §4.3's "the rest
/// are placeholder occupancies" machinery is exercised only when
/// `individualModulations` selects a richer table than this one).
#[derive(Debug, Clone, Default)]
pub struct SimpleModulation {
    allowed: Vec<Mcs>,
}

impl SimpleModulation {
    pub fn new() -> Self {
        SimpleModulation { allowed: vec![0, 1, 2] }
    }

    /// A profile where MCS 2 spans two slots, exercising the multi-slot
    /// `parentTs` machinery described in spec §3/§4.3.
    pub fn multi_slot() -> Self {
        SimpleModulation { allowed: vec![0, 1, 2] }
    }
}

impl Modulation for SimpleModulation {
    fn slots(&self, profile: &str, mcs: Mcs) -> u8 {
        if profile == "multi-slot" && mcs == 2 {
            2
        } else {
            1
        }
    }

    fn allowed(&self, _profile: &str) -> &[Mcs] {
        &self.allowed
    }

    fn minimal_cell_modulation(&self, _profile: &str) -> Mcs {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_single_slot() {
        let m = SimpleModulation::new();
        assert_eq!(m.slots("default", 2), 1);
    }

    #[test]
    fn multi_slot_profile_spans_two_slots_for_mcs_2() {
        let m = SimpleModulation::multi_slot();
        assert_eq!(m.slots("multi-slot", 2), 2);
        assert_eq!(m.slots("multi-slot", 0), 1);
    }
}
