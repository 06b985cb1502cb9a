//! Priority queue keyed by ASN (spec §4.1).
//!
//! Grounded on the teacher's `time_driver.rs` `SchedulerState` (a
//! `BTreeMap<tick, Vec<Waker>>` bucketed by virtual time), adapted from an
//! async-executor driver into a plain synchronous callback queue: this
//! engine has no async tasks to wake, only deterministic callbacks to run
//! to completion (spec §5's "no mid-callback suspension").

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::error::EngineError;
use crate::time::Asn;

/// Orders events dispatched within the same ASN (spec §4.1).
pub const PRIO_ACTIVE_CELL: u8 = 0;
pub const PRIO_APP_JOIN: u8 = 2;
pub const PRIO_BROADCAST_TX: u8 = 3;
pub const PRIO_MSF: u8 = 4;
pub const PRIO_SIXTOP_TIMEOUT: u8 = 5;

/// Identifies at most one pending event. Re-scheduling under an existing tag
/// supersedes the prior occurrence (spec §4.1, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTag(pub u64);

/// A callback queued for a future ASN. `Callback` is boxed so the scheduler
/// can own heterogeneous closures without generics leaking into `Node`.
pub type Callback<Ctx> = Box<dyn FnOnce(&mut Ctx, Asn) + 'static>;

struct Entry<Ctx> {
    asn: Asn,
    priority: u8,
    seq: u64,
    tag: Option<EventTag>,
    /// Bumped on each re-schedule of `tag`; an entry whose `generation`
    /// doesn't match the tag's latest generation is a stale tombstone.
    generation: u64,
    cb: Callback<Ctx>,
}

impl<Ctx> PartialEq for Entry<Ctx> {
    fn eq(&self, other: &Self) -> bool {
        self.asn == other.asn && self.priority == other.priority && self.seq == other.seq
    }
}
impl<Ctx> Eq for Entry<Ctx> {}

impl<Ctx> Ord for Entry<Ctx> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest (asn, priority,
        // seq) sorts to the top.
        (other.asn, other.priority, other.seq).cmp(&(self.asn, self.priority, self.seq))
    }
}
impl<Ctx> PartialOrd for Entry<Ctx> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Discrete-event scheduler, generic over the simulation context passed to
/// callbacks (spec §9: "explicit simulation context... avoid hidden
/// process-wide mutation").
pub struct EventScheduler<Ctx> {
    asn: Asn,
    heap: BinaryHeap<Entry<Ctx>>,
    next_seq: u64,
    /// Current generation per live tag; used to detect stale entries left
    /// behind by a re-schedule under the same tag.
    generations: HashMap<EventTag, u64>,
}

impl<Ctx> Default for EventScheduler<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> EventScheduler<Ctx> {
    pub fn new() -> Self {
        EventScheduler {
            asn: Asn::ZERO,
            heap: BinaryHeap::new(),
            next_seq: 0,
            generations: HashMap::new(),
        }
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Schedule `cb` to run at `asn`. If `tag` is `Some`, any previously
    /// pending event under the same tag is superseded (it is left in the
    /// heap as a tombstone and skipped at pop time).
    pub fn schedule_at_asn(
        &mut self,
        asn: Asn,
        priority: u8,
        tag: Option<EventTag>,
        cb: impl FnOnce(&mut Ctx, Asn) + 'static,
    ) -> Result<(), EngineError> {
        if asn < self.asn {
            return Err(EngineError::InvalidSchedule {
                asn,
                detail: format!("scheduled ASN {asn} is before current ASN {}", self.asn),
            });
        }
        let generation = if let Some(tag) = tag {
            let gen = self.generations.entry(tag).or_insert(0);
            *gen += 1;
            *gen
        } else {
            0
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            asn,
            priority,
            seq,
            tag,
            generation,
            cb: Box::new(cb),
        });
        Ok(())
    }

    /// Schedule `cb` to run `delay` slots from the current ASN.
    pub fn schedule_in(
        &mut self,
        delay: u64,
        priority: u8,
        tag: Option<EventTag>,
        cb: impl FnOnce(&mut Ctx, Asn) + 'static,
    ) -> Result<(), EngineError> {
        self.schedule_at_asn(self.asn + delay, priority, tag, cb)
    }

    /// Detach a pending event. A no-op if the tag has nothing pending (the
    /// tombstone check at pop time handles the rest).
    pub fn remove_event(&mut self, tag: EventTag) {
        if let Some(gen) = self.generations.get_mut(&tag) {
            *gen += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// ASN of the next live event, ignoring tombstoned entries left behind
    /// by `remove_event`/re-scheduling under the same tag.
    pub fn peek_asn(&mut self) -> Option<Asn> {
        while let Some(entry) = self.heap.peek() {
            if let Some(tag) = entry.tag {
                let current_gen = self.generations.get(&tag).copied().unwrap_or(0);
                if entry.generation != current_gen {
                    self.heap.pop();
                    continue;
                }
            }
            return Some(entry.asn);
        }
        None
    }

    /// Pop and run exactly one live event. Exposed so callers that need to
    /// interleave scheduler-external state (e.g. draining a context's
    /// outbox between events, per spec §9's explicit-context design) can
    /// drive the loop themselves instead of using [`Self::run`].
    pub fn pop_and_run(&mut self, ctx: &mut Ctx) -> bool {
        self.step(ctx)
    }

    /// Pop and run the next live event, advancing `self.asn` to its ASN.
    /// Returns `false` if the queue was empty.
    fn step(&mut self, ctx: &mut Ctx) -> bool {
        while let Some(entry) = self.heap.pop() {
            if let Some(tag) = entry.tag {
                let current_gen = self.generations.get(&tag).copied().unwrap_or(0);
                if entry.generation != current_gen {
                    continue; // stale, superseded or removed
                }
            }
            self.asn = entry.asn;
            (entry.cb)(ctx, entry.asn);
            return true;
        }
        false
    }

    /// Advance ASN and dispatch events until the queue is empty or
    /// `until` (exclusive) is reached.
    pub fn run_until(&mut self, ctx: &mut Ctx, until: Asn) {
        loop {
            match self.heap.peek() {
                Some(e) if e.asn < until => {
                    if !self.step(ctx) {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// Advance ASN and dispatch events until the queue is empty.
    pub fn run(&mut self, ctx: &mut Ctx) {
        while self.step(ctx) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_in_asn_then_priority_order() {
        let mut sched: EventScheduler<Vec<(Asn, u8)>> = EventScheduler::new();
        sched
            .schedule_at_asn(Asn(5), PRIO_MSF, None, |ctx, asn| ctx.push((asn, PRIO_MSF)))
            .unwrap();
        sched
            .schedule_at_asn(Asn(5), PRIO_ACTIVE_CELL, None, |ctx, asn| {
                ctx.push((asn, PRIO_ACTIVE_CELL))
            })
            .unwrap();
        sched
            .schedule_at_asn(Asn(3), PRIO_APP_JOIN, None, |ctx, asn| {
                ctx.push((asn, PRIO_APP_JOIN))
            })
            .unwrap();

        let mut log = Vec::new();
        sched.run(&mut log);
        assert_eq!(log, vec![(Asn(3), PRIO_APP_JOIN), (Asn(5), PRIO_ACTIVE_CELL), (Asn(5), PRIO_MSF)]);
    }

    #[test]
    fn rescheduling_under_same_tag_supersedes() {
        let mut sched: EventScheduler<Vec<u32>> = EventScheduler::new();
        let tag = EventTag(1);
        sched.schedule_at_asn(Asn(10), 0, Some(tag), |ctx, _| ctx.push(1)).unwrap();
        sched.schedule_at_asn(Asn(20), 0, Some(tag), |ctx, _| ctx.push(2)).unwrap();

        let mut log = Vec::new();
        sched.run(&mut log);
        assert_eq!(log, vec![2]);
    }

    #[test]
    fn remove_event_detaches_pending() {
        let mut sched: EventScheduler<Vec<u32>> = EventScheduler::new();
        let tag = EventTag(7);
        sched.schedule_at_asn(Asn(10), 0, Some(tag), |ctx, _| ctx.push(1)).unwrap();
        sched.remove_event(tag);

        let mut log = Vec::new();
        sched.run(&mut log);
        assert!(log.is_empty());
    }

    #[test]
    fn rejects_asn_before_current() {
        let mut sched: EventScheduler<()> = EventScheduler::new();
        sched.schedule_at_asn(Asn(5), 0, None, |_, _| {}).unwrap();
        sched.run(&mut ());
        assert_eq!(sched.asn(), Asn(5));
        let err = sched.schedule_at_asn(Asn(1), 0, None, |_, _| {});
        assert!(matches!(err, Err(EngineError::InvalidSchedule { .. })));
    }
}
