//! TSCH backoff generators (spec §4.3).
//!
//! Two independent generators exist per node: one broadcast, one per
//! neighbor. Spec §9 normalizes the reset value to `backoffMinExp - 1`
//! (the source mixes that with a hardcoded `2 - 1` for broadcast; we do
//! not reproduce that inconsistency).

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    exponent: i16,
    counter: u32,
    min_exp: u8,
    max_exp: u8,
}

impl Backoff {
    pub fn new(min_exp: u8, max_exp: u8) -> Self {
        let mut b = Backoff {
            exponent: 0,
            counter: 0,
            min_exp,
            max_exp,
        };
        b.reset();
        b
    }

    /// Resets exponent to `backoffMinExp - 1` and counter to zero. Fires on
    /// a successful ACK, an empty TX-direction queue, or a parent change
    /// (spec §4.3).
    pub fn reset(&mut self) {
        self.exponent = self.min_exp as i16 - 1;
        self.counter = 0;
    }

    /// Whether the cell may transmit this activation: the counter must have
    /// reached zero.
    pub fn ready(&self) -> bool {
        self.counter == 0
    }

    /// Decrement the counter once per activation of the relevant SHARED
    /// cell (spec §4.3).
    pub fn tick(&mut self) {
        if self.counter > 0 {
            self.counter -= 1;
        }
    }

    /// On an unacknowledged transmission: bump the exponent (capped at
    /// `backoffMaxExp`) and draw a fresh counter uniformly in
    /// `[0, 2^exp - 1]`.
    pub fn backoff_on_failure(&mut self, rng: &mut impl Rng) {
        let exp = (self.exponent.max(0) as u32 + 1).min(self.max_exp as u32);
        self.exponent = exp as i16;
        let span = 1u32 << exp;
        self.counter = if span <= 1 { 0 } else { rng.gen_range(0..span) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn reset_uses_min_exp_minus_one() {
        let b = Backoff::new(1, 7);
        assert!(b.ready());
    }

    #[test]
    fn failure_increases_exponent_up_to_cap() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut b = Backoff::new(1, 2);
        b.backoff_on_failure(&mut rng);
        assert_eq!(b.exponent, 1);
        b.backoff_on_failure(&mut rng);
        assert_eq!(b.exponent, 2);
        b.backoff_on_failure(&mut rng);
        assert_eq!(b.exponent, 2); // capped
    }

    #[test]
    fn tick_decrements_until_zero() {
        let mut b = Backoff::new(1, 7);
        b.counter = 2;
        b.tick();
        assert_eq!(b.counter, 1);
        b.tick();
        assert_eq!(b.counter, 0);
        b.tick();
        assert_eq!(b.counter, 0);
    }
}
