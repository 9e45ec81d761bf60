//! Connection hash tables.
//!
//! Each group, and the shared wildcard table, is a power-of-two array of buckets. Connected
//! entries hash on the foreign address and both ports; wildcard entries hash on the local port
//! only, since the foreign side is unknown.

use super::hash::addr32;
use super::pcb::{PcbId, PcbTuple};
use super::PcbGroupError;

use std::net::IpAddr;

/// One indexed connection.
#[derive(Debug, Clone, Copy)]
struct Entry {
    id: PcbId,
    key: PcbTuple,
}

/// Bucketed hash table of connection identifiers.
#[derive(Debug)]
pub struct PcbHashTable {
    buckets: Vec<Vec<Entry>>,
    mask: u32,
    len: usize,
}

impl PcbHashTable {
    /// Creates a table sized for about `hint` connections. The bucket count is `hint` rounded up
    /// to a power of two.
    pub(crate) fn with_size_hint(hint: usize) -> Result<Self, PcbGroupError> {
        let nbuckets = hint
            .max(1)
            .checked_next_power_of_two()
            .filter(|n| *n - 1 <= u32::MAX as usize)
            .ok_or(PcbGroupError::SizeHint(hint))?;
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(nbuckets)?;
        buckets.resize_with(nbuckets, Vec::new);
        Ok(PcbHashTable {
            buckets,
            mask: (nbuckets - 1) as u32,
            len: 0,
        })
    }

    /// Creates a single-bucket table without a fallible allocation.
    pub(crate) fn empty() -> Self {
        PcbHashTable {
            buckets: vec![Vec::new()],
            mask: 0,
            len: 0,
        }
    }

    /// Number of indexed connections.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    pub fn nb_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket mask (`nb_buckets - 1`).
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Bucket of a connected entry.
    #[inline]
    pub(crate) fn connected_bucket(&self, key: &PcbTuple) -> usize {
        let faddr = addr32(key.faddr);
        let ports = u32::from(key.lport ^ key.fport);
        ((faddr ^ (faddr >> 16) ^ ports) & self.mask) as usize
    }

    /// Bucket of a wildcard entry.
    #[inline]
    pub(crate) fn wildcard_bucket(&self, lport: u16) -> usize {
        (u32::from(lport) & self.mask) as usize
    }

    pub(crate) fn insert(&mut self, bucket: usize, id: PcbId, key: PcbTuple) {
        debug_assert!(
            !self.buckets[bucket].iter().any(|e| e.id == id),
            "{} indexed twice",
            id
        );
        self.buckets[bucket].push(Entry { id, key });
        self.len += 1;
    }

    /// Removes `id` from `bucket`. Returns `false` if it was not there.
    pub(crate) fn remove(&mut self, bucket: usize, id: PcbId) -> bool {
        let chain = &mut self.buckets[bucket];
        match chain.iter().position(|e| e.id == id) {
            Some(pos) => {
                chain.swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `id` is indexed anywhere in the table.
    pub fn contains(&self, id: PcbId) -> bool {
        self.iter().any(|(e, _)| e == id)
    }

    /// Iterates over all entries and the tuples they are keyed under.
    pub fn iter(&self) -> impl Iterator<Item = (PcbId, &PcbTuple)> + '_ {
        self.buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|e| (e.id, &e.key)))
    }

    /// Finds the connection keyed under exactly `key`.
    pub fn lookup_connected(&self, key: &PcbTuple) -> Option<PcbId> {
        self.buckets[self.connected_bucket(key)]
            .iter()
            .find(|e| e.key == *key)
            .map(|e| e.id)
    }

    /// Finds the best wildcard match for traffic to `laddr:lport`.
    ///
    /// An entry bound to `laddr` wins over one bound to the unspecified address. Entries of the
    /// other address family never match.
    pub fn lookup_wildcard(&self, laddr: IpAddr, lport: u16) -> Option<PcbId> {
        let mut any = None;
        for e in self.buckets[self.wildcard_bucket(lport)].iter() {
            if e.key.lport != lport || e.key.laddr.is_ipv4() != laddr.is_ipv4() {
                continue;
            }
            if e.key.laddr == laddr {
                return Some(e.id);
            }
            if e.key.laddr.is_unspecified() && any.is_none() {
                any = Some(e.id);
            }
        }
        any
    }

    /// Drops every entry, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        let len = self.len;
        self.buckets.iter_mut().for_each(Vec::clear);
        self.len = 0;
        len
    }
}
