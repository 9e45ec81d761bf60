//! Per-thread group statistics.
//!
//! Counters are thread-local so the hot path never contends on a shared cache line. A thread
//! reads its own totals with [snapshot](snapshot).

use std::cell::Cell;

use serde::Serialize;

thread_local! {
    pub(crate) static GROUP_INSERTS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static GROUP_REMOVES: Cell<u64> = const { Cell::new(0) };
    pub(crate) static GROUP_REKEYS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static WILDCARD_INSERTS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static WILDCARD_REMOVES: Cell<u64> = const { Cell::new(0) };
    pub(crate) static LOOKUP_HITS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static LOOKUP_WILDCARD_HITS: Cell<u64> = const { Cell::new(0) };
    pub(crate) static LOOKUP_MISSES: Cell<u64> = const { Cell::new(0) };
    pub(crate) static FLOW_HINT_FALLBACKS: Cell<u64> = const { Cell::new(0) };
}

pub(crate) trait StatExt: Sized {
    fn inc(&'static self) {
        self.inc_by(1);
    }
    fn inc_by(&'static self, val: u64);
}

impl StatExt for std::thread::LocalKey<Cell<u64>> {
    fn inc_by(&'static self, val: u64) {
        self.set(self.get() + val);
    }
}

/// Counter values of one thread.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct PcbGroupStats {
    /// Connections inserted into a group.
    pub group_inserts: u64,
    /// Connections removed from a group.
    pub group_removes: u64,
    /// Connections re-keyed within the same group.
    pub group_rekeys: u64,
    /// Connections inserted into the wildcard table.
    pub wildcard_inserts: u64,
    /// Connections removed from the wildcard table.
    pub wildcard_removes: u64,
    /// Lookups answered by a group table.
    pub lookup_hits: u64,
    /// Lookups answered by the wildcard table.
    pub lookup_wildcard_hits: u64,
    /// Lookups that found nothing.
    pub lookup_misses: u64,
    /// Flow hints that could not be used for group selection.
    pub flow_hint_fallbacks: u64,
}

impl PcbGroupStats {
    /// Sums the counters of `other` into `self`.
    pub fn merge(&mut self, other: &PcbGroupStats) {
        self.group_inserts += other.group_inserts;
        self.group_removes += other.group_removes;
        self.group_rekeys += other.group_rekeys;
        self.wildcard_inserts += other.wildcard_inserts;
        self.wildcard_removes += other.wildcard_removes;
        self.lookup_hits += other.lookup_hits;
        self.lookup_wildcard_hits += other.lookup_wildcard_hits;
        self.lookup_misses += other.lookup_misses;
        self.flow_hint_fallbacks += other.flow_hint_fallbacks;
    }
}

/// Returns the calling thread's counters.
pub fn snapshot() -> PcbGroupStats {
    PcbGroupStats {
        group_inserts: GROUP_INSERTS.get(),
        group_removes: GROUP_REMOVES.get(),
        group_rekeys: GROUP_REKEYS.get(),
        wildcard_inserts: WILDCARD_INSERTS.get(),
        wildcard_removes: WILDCARD_REMOVES.get(),
        lookup_hits: LOOKUP_HITS.get(),
        lookup_wildcard_hits: LOOKUP_WILDCARD_HITS.get(),
        lookup_misses: LOOKUP_MISSES.get(),
        flow_hint_fallbacks: FLOW_HINT_FALLBACKS.get(),
    }
}

/// Zeroes the calling thread's counters.
pub fn reset() {
    for stat in [
        &GROUP_INSERTS,
        &GROUP_REMOVES,
        &GROUP_REKEYS,
        &WILDCARD_INSERTS,
        &WILDCARD_REMOVES,
        &LOOKUP_HITS,
        &LOOKUP_WILDCARD_HITS,
        &LOOKUP_MISSES,
        &FLOW_HINT_FALLBACKS,
    ] {
        stat.set(0);
    }
}
