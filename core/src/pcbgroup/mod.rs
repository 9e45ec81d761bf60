//! Connection groups.
//!
//! Partitions the connection table of a protocol into one group per processor so that the
//! steady-state lookup for a received packet takes a single group lock and touches a single,
//! cache-local hash table. Connections with a foreign address are placed in the group chosen by
//! the [bucket selector](hash), consistent with the NIC's receive-side scaling. Connections that
//! can receive traffic from any peer (unspecified foreign address) cannot be assigned to one
//! group; they live in a shared wildcard table that is modified only while every group lock is
//! held.
//!
//! A connection is in at most one table at a time:
//!
//! - foreign address unspecified, not dropped: the wildcard table;
//! - foreign address set, not dropped: the group selected for its tuple;
//! - dropped, or never updated: no table.
//!
//! Callers keep this true by calling [update](PcbGroups::update) after every change to a
//! connection's addressing and [remove](PcbGroups::remove) before destroying it, while holding
//! the connection exclusively.

mod group;
pub mod hash;
pub mod pcb;
pub mod table;

pub use self::group::{AllGroupsGuard, GroupGuard};
pub use self::hash::{FlowHash, FlowHashType, GroupIndex, HashFields};
pub use self::pcb::{Membership, Pcb, PcbId, PcbTuple};
pub use self::table::PcbHashTable;

use self::group::{PcbGroup, WildcardTable};
use self::hash::BucketSelector;
use crate::config::PcbGroupConfig;
use crate::lcore::CoreId;
use crate::stats::{
    StatExt, FLOW_HINT_FALLBACKS, GROUP_INSERTS, GROUP_REKEYS, GROUP_REMOVES, LOOKUP_HITS,
    LOOKUP_MISSES, LOOKUP_WILDCARD_HITS, WILDCARD_INSERTS, WILDCARD_REMOVES,
};

use std::collections::TryReserveError;
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Whether a lookup may fall back to the wildcard table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LookupMode {
    /// Only fully specified connections match.
    Exact,
    /// Fall back to listening/any-peer connections.
    Wildcard,
}

/// Connection groups of one protocol.
///
/// Constructed once at protocol bring-up and shared by reference (e.g., in an `Arc`) with every
/// packet processing thread. The group count never changes after construction.
pub struct PcbGroups {
    /// Hash fields and group count. `group_count == 0` means grouping is disabled.
    selector: BucketSelector,
    /// One entry per group, indexed by `GroupIndex`.
    groups: Vec<PcbGroup>,
    /// Listening/any-peer connections, shared by all groups.
    wildcard: WildcardTable,
}

impl PcbGroups {
    /// Creates `ncpus` groups, each with a hash table sized for `size_hint` connections.
    ///
    /// Grouping is disabled (and `Ok` is returned) if `hash_fields` is
    /// [HashFields::None](HashFields::None) or there is a single processor.
    pub fn new(
        hash_fields: HashFields,
        size_hint: usize,
        ncpus: usize,
    ) -> Result<Self, PcbGroupError> {
        if hash_fields == HashFields::None {
            log::info!("Connection groups disabled: no hash fields");
            return Ok(PcbGroups::disabled_with(hash_fields));
        }
        if ncpus <= 1 {
            log::info!("Connection groups disabled: single processor");
            return Ok(PcbGroups::disabled_with(hash_fields));
        }

        let mut groups = Vec::new();
        groups.try_reserve_exact(ncpus)?;
        for index in 0..ncpus {
            let table = PcbHashTable::with_size_hint(size_hint)?;
            // Round-robin over processors.
            let affinity = CoreId((index % ncpus) as u32);
            groups.push(PcbGroup::new(table, affinity));
        }
        let wildcard = WildcardTable::new(PcbHashTable::with_size_hint(size_hint)?);

        log::info!(
            "Initialized {} connection groups ({} hash, {} buckets per table)",
            ncpus,
            hash_fields,
            size_hint.max(1).next_power_of_two(),
        );
        Ok(PcbGroups {
            selector: BucketSelector::new(hash_fields, ncpus),
            groups,
            wildcard,
        })
    }

    /// Creates groups as configured by `config`.
    ///
    /// If `config.fallback_disabled` is set, an allocation failure yields a disabled instance
    /// instead of an error.
    pub fn from_config(config: &PcbGroupConfig) -> Result<Self, PcbGroupError> {
        match PcbGroups::new(
            config.hash_fields,
            config.table_size_hint,
            config.nb_groups(),
        ) {
            Err(e) if config.fallback_disabled => {
                log::warn!("Running without connection groups: {}", e);
                Ok(PcbGroups::disabled_with(config.hash_fields))
            }
            result => result,
        }
    }

    /// Creates an instance with grouping disabled. Every operation is a no-op.
    pub fn disabled() -> Self {
        PcbGroups::disabled_with(HashFields::None)
    }

    fn disabled_with(hash_fields: HashFields) -> Self {
        PcbGroups {
            selector: BucketSelector::new(hash_fields, 0),
            groups: Vec::new(),
            wildcard: WildcardTable::new(PcbHashTable::empty()),
        }
    }

    /// Frees all groups and the wildcard table, disabling grouping. Called once at protocol
    /// teardown; dropping the value frees the tables without the membership checks.
    ///
    /// No connection may be a member at this point. Calling it on a disabled instance is a no-op.
    pub fn destroy(&mut self) {
        if !self.is_enabled() {
            return;
        }
        for (index, group) in self.groups.iter_mut().enumerate() {
            let leaked = group.table_mut().clear();
            debug_assert_eq!(leaked, 0, "group {} destroyed with members", index);
        }
        let leaked = self.wildcard.get_mut().clear();
        debug_assert_eq!(leaked, 0, "wildcard table destroyed with members");
        self.groups = Vec::new();
        self.wildcard = WildcardTable::new(PcbHashTable::empty());
        self.selector.group_count = 0;
        log::info!("Destroyed connection groups");
    }

    /// Returns `true` if grouping is enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.selector.group_count != 0
    }

    /// Number of groups. `0` if disabled.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.selector.group_count
    }

    pub fn hash_fields(&self) -> HashFields {
        self.selector.fields
    }

    /// Processor group `index` is intended to be served by.
    pub fn group_affinity(&self, index: GroupIndex) -> Option<CoreId> {
        self.groups.get(index.raw()).map(PcbGroup::affinity)
    }

    /// Selects the group for a connection tuple.
    ///
    /// Must not be called while grouping is disabled.
    #[inline]
    pub fn select_group_by_tuple(
        &self,
        laddr: IpAddr,
        lport: u16,
        faddr: IpAddr,
        fport: u16,
    ) -> GroupIndex {
        self.selector.by_tuple(laddr, lport, faddr, fport)
    }

    /// Selects the group for a hardware flow hash.
    ///
    /// Always returns `None`: a hardware hash does not reproduce the tuple hash, and a connection
    /// must be found in the same group whether or not a packet carries a hint. The caller selects
    /// by tuple.
    #[inline]
    pub fn select_group_by_flow_hint(&self, hint: FlowHash) -> Option<GroupIndex> {
        self.selector.by_flow_hint(hint)
    }

    /// Selects the group for a lookup key, preferring a usable flow hint.
    fn select_group(&self, tuple: &PcbTuple, hint: Option<FlowHash>) -> GroupIndex {
        if let Some(hint) = hint {
            match self.select_group_by_flow_hint(hint) {
                Some(index) => return index,
                None => FLOW_HINT_FALLBACKS.inc(),
            }
        }
        self.selector
            .by_tuple(tuple.laddr, tuple.lport, tuple.faddr, tuple.fport)
    }

    /// The group `pcb` belongs in, or `None` if it belongs in no group.
    fn target_group(&self, pcb: &Pcb, hint: Option<FlowHash>) -> Option<GroupIndex> {
        if pcb.tuple().is_wildcard() || pcb.is_dropped() {
            return None;
        }
        Some(self.select_group(pcb.tuple(), hint))
    }

    /// Brings the membership of `pcb` in line with its current tuple and state.
    ///
    /// Must be called after every change to the connection's addressing or dropped state.
    /// `hint` is the flow hash of the packet that triggered the change, if any; placement is the
    /// same with or without it.
    pub fn update(&self, pcb: &mut Pcb, hint: Option<FlowHash>) {
        if !self.is_enabled() {
            return;
        }
        let tuple = *pcb.tuple();
        let wildcard_needed = pcb.wildcard_needed();
        let target = self.target_group(pcb, hint);

        match pcb.membership {
            Membership::Group { index, key } if target == Some(index) => {
                if key != tuple {
                    self.rekey_in_group(index, pcb.id(), &key, tuple);
                    pcb.membership = Membership::Group { index, key: tuple };
                }
                return;
            }
            Membership::Group { index, key } => {
                self.remove_from_group(index, pcb.id(), &key);
                pcb.membership = Membership::Ungrouped;
            }
            Membership::Wildcard { key } if wildcard_needed => {
                if key != tuple {
                    self.rekey_in_wildcard(pcb.id(), &key, tuple);
                    pcb.membership = Membership::Wildcard { key: tuple };
                }
                return;
            }
            Membership::Wildcard { key } => {
                self.remove_from_wildcard(pcb.id(), &key);
                pcb.membership = Membership::Ungrouped;
            }
            Membership::Ungrouped => {}
        }

        if wildcard_needed {
            self.insert_into_wildcard(pcb.id(), tuple);
            pcb.membership = Membership::Wildcard { key: tuple };
        } else if let Some(index) = target {
            self.insert_into_group(index, pcb.id(), tuple);
            pcb.membership = Membership::Group { index, key: tuple };
        }
    }

    /// Removes `pcb` from whichever table it is in. A no-op if it is in none.
    pub fn remove(&self, pcb: &mut Pcb) {
        if !self.is_enabled() {
            return;
        }
        match pcb.membership {
            Membership::Group { index, key } => self.remove_from_group(index, pcb.id(), &key),
            Membership::Wildcard { key } => self.remove_from_wildcard(pcb.id(), &key),
            Membership::Ungrouped => return,
        }
        pcb.membership = Membership::Ungrouped;
    }

    /// Finds the connection for a received packet.
    ///
    /// Locks only the selected group. With [LookupMode::Wildcard](LookupMode::Wildcard), falls
    /// back to the wildcard table under the same lock. `hint` is the packet's flow hash, if any.
    pub fn lookup(
        &self,
        tuple: &PcbTuple,
        hint: Option<FlowHash>,
        mode: LookupMode,
    ) -> Option<PcbId> {
        if !self.is_enabled() {
            return None;
        }
        let guard = self.guard(self.select_group(tuple, hint));
        if let Some(id) = guard.table().lookup_connected(tuple) {
            LOOKUP_HITS.inc();
            return Some(id);
        }
        if mode == LookupMode::Wildcard {
            if let Some(id) = guard.wildcard().lookup_wildcard(tuple.laddr, tuple.lport) {
                LOOKUP_WILDCARD_HITS.inc();
                return Some(id);
            }
        }
        LOOKUP_MISSES.inc();
        None
    }

    /// Locks group `index`. Returns `None` if `index` is out of range, which includes every
    /// index while grouping is disabled.
    pub fn lock_group(&self, index: GroupIndex) -> Option<GroupGuard<'_>> {
        let group = self.groups.get(index.raw())?;
        Some(GroupGuard::new(index, group.lock(), &self.wildcard))
    }

    /// Locks a group returned by the selector.
    fn guard(&self, index: GroupIndex) -> GroupGuard<'_> {
        GroupGuard::new(index, self.groups[index.raw()].lock(), &self.wildcard)
    }

    /// Locks every group in ascending order. Returns `None` if grouping is disabled.
    pub fn lock_all(&self) -> Option<AllGroupsGuard<'_>> {
        if !self.is_enabled() {
            return None;
        }
        let tables = self.groups.iter().map(PcbGroup::lock).collect();
        Some(AllGroupsGuard::new(tables, &self.wildcard))
    }

    /// Number of connections in group `index`. Takes the group lock.
    pub fn group_len(&self, index: GroupIndex) -> usize {
        match self.groups.get(index.raw()) {
            Some(group) => group.lock().len(),
            None => 0,
        }
    }

    /// Number of connections in the wildcard table. Takes one group lock.
    pub fn wildcard_len(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        self.guard(GroupIndex(0)).wildcard().len()
    }

    fn insert_into_group(&self, index: GroupIndex, id: PcbId, key: PcbTuple) {
        let mut guard = self.guard(index);
        let table = guard.table_mut();
        let bucket = table.connected_bucket(&key);
        table.insert(bucket, id, key);
        GROUP_INSERTS.inc();
        log::trace!("{} ({}) joined group {}", id, key, index);
    }

    fn remove_from_group(&self, index: GroupIndex, id: PcbId, key: &PcbTuple) {
        let mut guard = self.guard(index);
        let table = guard.table_mut();
        let bucket = table.connected_bucket(key);
        let removed = table.remove(bucket, id);
        debug_assert!(removed, "{} missing from group {}", id, index);
        GROUP_REMOVES.inc();
        log::trace!("{} left group {}", id, index);
    }

    fn rekey_in_group(&self, index: GroupIndex, id: PcbId, old: &PcbTuple, new: PcbTuple) {
        let mut guard = self.guard(index);
        let table = guard.table_mut();
        let bucket = table.connected_bucket(old);
        let removed = table.remove(bucket, id);
        debug_assert!(removed, "{} missing from group {}", id, index);
        let bucket = table.connected_bucket(&new);
        table.insert(bucket, id, new);
        GROUP_REKEYS.inc();
    }

    fn lock_all_enabled(&self) -> AllGroupsGuard<'_> {
        let tables = self.groups.iter().map(PcbGroup::lock).collect();
        AllGroupsGuard::new(tables, &self.wildcard)
    }

    fn insert_into_wildcard(&self, id: PcbId, key: PcbTuple) {
        let mut guard = self.lock_all_enabled();
        let table = guard.wildcard_mut();
        let bucket = table.wildcard_bucket(key.lport);
        table.insert(bucket, id, key);
        WILDCARD_INSERTS.inc();
        log::trace!("{} ({}) joined wildcard table", id, key.local());
    }

    fn remove_from_wildcard(&self, id: PcbId, key: &PcbTuple) {
        let mut guard = self.lock_all_enabled();
        let table = guard.wildcard_mut();
        let bucket = table.wildcard_bucket(key.lport);
        let removed = table.remove(bucket, id);
        debug_assert!(removed, "{} missing from wildcard table", id);
        WILDCARD_REMOVES.inc();
        log::trace!("{} left wildcard table", id);
    }

    fn rekey_in_wildcard(&self, id: PcbId, old: &PcbTuple, new: PcbTuple) {
        let mut guard = self.lock_all_enabled();
        let table = guard.wildcard_mut();
        let bucket = table.wildcard_bucket(old.lport);
        let removed = table.remove(bucket, id);
        debug_assert!(removed, "{} missing from wildcard table", id);
        let bucket = table.wildcard_bucket(new.lport);
        table.insert(bucket, id, new);
    }
}

impl fmt::Debug for PcbGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcbGroups")
            .field("hash_fields", &self.selector.fields)
            .field("group_count", &self.selector.group_count)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum PcbGroupError {
    #[error("Connection group table allocation failed")]
    Alloc(#[from] TryReserveError),

    #[error("Invalid hash table size hint: {0}")]
    SizeHint(usize),
}
