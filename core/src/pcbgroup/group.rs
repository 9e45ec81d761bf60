//! Groups and their locks.
//!
//! Every group owns a hash table behind its own mutex. The wildcard table has no lock of its own:
//! it is read while holding any one group lock and written only while holding all of them,
//! acquired in ascending group order.

use super::hash::GroupIndex;
use super::table::PcbHashTable;
use crate::lcore::CoreId;

use std::cell::UnsafeCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

/// One shard of the connection table.
#[derive(Debug)]
pub(crate) struct PcbGroup {
    table: CachePadded<Mutex<PcbHashTable>>,
    affinity: CoreId,
}

impl PcbGroup {
    pub(crate) fn new(table: PcbHashTable, affinity: CoreId) -> Self {
        PcbGroup {
            table: CachePadded::new(Mutex::new(table)),
            affinity,
        }
    }

    pub(crate) fn affinity(&self) -> CoreId {
        self.affinity
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PcbHashTable> {
        // Tables are consistent at every point a holder could panic.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn table_mut(&mut self) -> &mut PcbHashTable {
        self.table
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Table shared by all groups, guarded by the group locks collectively.
#[derive(Debug)]
pub(crate) struct WildcardTable(UnsafeCell<PcbHashTable>);

// SAFETY: the table is only reachable through `GroupGuard` (shared access, one group lock held)
// and `AllGroupsGuard` (exclusive access, every group lock held) of the `PcbGroups` that owns it,
// or through `&mut` to that owner. A writer therefore excludes every reader and every other
// writer.
unsafe impl Sync for WildcardTable {}

impl WildcardTable {
    pub(crate) fn new(table: PcbHashTable) -> Self {
        WildcardTable(UnsafeCell::new(table))
    }

    pub(crate) fn get_mut(&mut self) -> &mut PcbHashTable {
        self.0.get_mut()
    }
}

/// Exclusive access to one group, and shared access to the wildcard table.
pub struct GroupGuard<'a> {
    index: GroupIndex,
    table: MutexGuard<'a, PcbHashTable>,
    wildcard: &'a WildcardTable,
}

impl<'a> GroupGuard<'a> {
    pub(crate) fn new(
        index: GroupIndex,
        table: MutexGuard<'a, PcbHashTable>,
        wildcard: &'a WildcardTable,
    ) -> Self {
        GroupGuard {
            index,
            table,
            wildcard,
        }
    }

    /// The locked group.
    pub fn index(&self) -> GroupIndex {
        self.index
    }

    /// The group's hash table.
    pub fn table(&self) -> &PcbHashTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut PcbHashTable {
        &mut self.table
    }

    /// The wildcard table.
    pub fn wildcard(&self) -> &PcbHashTable {
        // SAFETY: this guard holds a group lock, so no `AllGroupsGuard` exists.
        unsafe { &*self.wildcard.0.get() }
    }
}

/// Every group lock, held in ascending order. Grants mutable access to the wildcard table.
pub struct AllGroupsGuard<'a> {
    tables: Vec<MutexGuard<'a, PcbHashTable>>,
    wildcard: &'a WildcardTable,
}

impl<'a> AllGroupsGuard<'a> {
    pub(crate) fn new(tables: Vec<MutexGuard<'a, PcbHashTable>>, wildcard: &'a WildcardTable) -> Self {
        debug_assert!(!tables.is_empty());
        AllGroupsGuard { tables, wildcard }
    }

    /// Number of groups held.
    pub fn group_count(&self) -> usize {
        self.tables.len()
    }

    /// The hash table of group `index`, or `None` if `index` is out of range.
    pub fn group(&self, index: GroupIndex) -> Option<&PcbHashTable> {
        self.tables.get(index.raw()).map(|table| &**table)
    }

    /// Iterates over every group's hash table in index order.
    pub fn iter(&self) -> impl Iterator<Item = (GroupIndex, &PcbHashTable)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .map(|(index, table)| (GroupIndex(index), &**table))
    }

    /// The wildcard table.
    pub fn wildcard(&self) -> &PcbHashTable {
        // SAFETY: every group lock is held by this guard.
        unsafe { &*self.wildcard.0.get() }
    }

    pub(crate) fn wildcard_mut(&mut self) -> &mut PcbHashTable {
        // SAFETY: every group lock is held by this guard, and `&mut self` makes it unique.
        unsafe { &mut *self.wildcard.0.get() }
    }
}

impl Drop for AllGroupsGuard<'_> {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while self.tables.pop().is_some() {}
    }
}
