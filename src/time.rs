//! Absolute Slot Number and slotframe arithmetic.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Absolute Slot Number: a monotonic slot counter shared by the whole
/// simulation (spec §3, §GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Asn(pub u64);

impl Asn {
    pub const ZERO: Asn = Asn(0);

    /// `ASN mod slotframeLength`: the currently active cell offset.
    pub fn slot_offset(self, slotframe_length: u16) -> u16 {
        (self.0 % slotframe_length as u64) as u16
    }

    pub fn saturating_sub(self, rhs: Asn) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for Asn {
    type Output = Asn;
    fn add(self, rhs: u64) -> Asn {
        Asn(self.0 + rhs)
    }
}

impl AddAssign<u64> for Asn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Asn {
    type Output = i64;
    fn sub(self, rhs: Asn) -> i64 {
        self.0 as i64 - rhs.0 as i64
    }
}
