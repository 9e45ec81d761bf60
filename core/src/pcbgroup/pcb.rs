//! Protocol control blocks as seen by the group layer.
//!
//! A [Pcb](Pcb) is created, owned, and destroyed by the connection table that sits above this
//! crate. The group layer only records where the connection is indexed (its
//! [Membership](Membership)) and never holds a reference to the connection itself: tables store
//! the [PcbId](PcbId) and the tuple the entry was keyed under.

use super::hash::GroupIndex;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

/// Caller-assigned connection identifier, returned from lookups.
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Serialize)]
pub struct PcbId(pub u64);

impl fmt::Display for PcbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// Connection 4-tuple, from the point of view of the local endpoint.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct PcbTuple {
    pub laddr: IpAddr,
    pub lport: u16,
    pub faddr: IpAddr,
    pub fport: u16,
}

impl PcbTuple {
    /// Creates a tuple for a connection between `local` and `foreign`.
    pub fn new(local: SocketAddr, foreign: SocketAddr) -> Self {
        PcbTuple {
            laddr: local.ip(),
            lport: local.port(),
            faddr: foreign.ip(),
            fport: foreign.port(),
        }
    }

    /// Creates a tuple with an unspecified foreign endpoint of the same address family as
    /// `local`.
    pub fn wildcard(local: SocketAddr) -> Self {
        PcbTuple {
            laddr: local.ip(),
            lport: local.port(),
            faddr: unspecified_like(local.ip()),
            fport: 0,
        }
    }

    /// Creates the lookup key for a received packet sent from `src` to `dst`.
    pub fn from_inbound(src: SocketAddr, dst: SocketAddr) -> Self {
        PcbTuple::new(dst, src)
    }

    /// Returns `true` if the foreign address is unspecified.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.faddr.is_unspecified()
    }

    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.laddr, self.lport)
    }

    pub fn foreign(&self) -> SocketAddr {
        SocketAddr::new(self.faddr, self.fport)
    }
}

impl fmt::Display for PcbTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.local(), self.foreign())
    }
}

fn unspecified_like(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Where a connection is currently indexed.
///
/// `key` is the tuple the table entry was inserted under, which may lag behind the connection's
/// tuple until the next [update](super::PcbGroups::update).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Membership {
    /// Not indexed by any table.
    Ungrouped,
    /// Indexed by the hash table of group `index`.
    Group { index: GroupIndex, key: PcbTuple },
    /// Indexed by the shared wildcard table.
    Wildcard { key: PcbTuple },
}

/// A connection control block.
///
/// Mutating methods take `&mut self`: the caller must hold the connection exclusively (its write
/// lock) while changing the tuple and while calling into [PcbGroups](super::PcbGroups).
#[derive(Debug)]
pub struct Pcb {
    id: PcbId,
    tuple: PcbTuple,
    dropped: bool,
    pub(super) membership: Membership,
}

impl Pcb {
    /// Creates a connection bound to `local` with no foreign endpoint.
    pub fn new(id: PcbId, local: SocketAddr) -> Self {
        Pcb::with_tuple(id, PcbTuple::wildcard(local))
    }

    /// Creates a connection with the given tuple.
    pub fn with_tuple(id: PcbId, tuple: PcbTuple) -> Self {
        Pcb {
            id,
            tuple,
            dropped: false,
            membership: Membership::Ungrouped,
        }
    }

    pub fn id(&self) -> PcbId {
        self.id
    }

    pub fn tuple(&self) -> &PcbTuple {
        &self.tuple
    }

    /// Rebinds the local endpoint.
    pub fn set_local(&mut self, local: SocketAddr) {
        self.set_tuple(PcbTuple {
            laddr: local.ip(),
            lport: local.port(),
            ..self.tuple
        });
    }

    /// Sets the foreign endpoint.
    pub fn connect(&mut self, foreign: SocketAddr) {
        self.set_tuple(PcbTuple {
            faddr: foreign.ip(),
            fport: foreign.port(),
            ..self.tuple
        });
    }

    /// Clears the foreign endpoint, returning the connection to the any-peer state.
    pub fn disconnect(&mut self) {
        self.set_tuple(PcbTuple::wildcard(self.tuple.local()));
    }

    /// Replaces the whole tuple.
    pub fn set_tuple(&mut self, tuple: PcbTuple) {
        self.tuple = tuple;
    }

    /// Marks the connection as no longer routable. It leaves its group on the next update.
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    /// Returns the group the connection is indexed by, if any.
    pub fn group(&self) -> Option<GroupIndex> {
        match self.membership {
            Membership::Group { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Returns `true` if the connection is indexed by the wildcard table.
    pub fn in_wildcard(&self) -> bool {
        matches!(self.membership, Membership::Wildcard { .. })
    }

    /// Returns `true` if the connection belongs in the wildcard table.
    #[inline]
    pub(super) fn wildcard_needed(&self) -> bool {
        self.tuple.is_wildcard() && !self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn core_new_pcb_is_wildcard_and_ungrouped() {
        let pcb = Pcb::new(PcbId(1), sock("10.0.0.1:80"));
        assert!(pcb.tuple().is_wildcard());
        assert_eq!(pcb.tuple().fport, 0);
        assert_eq!(pcb.membership(), Membership::Ungrouped);
        assert!(pcb.wildcard_needed());
    }

    #[test]
    fn core_ipv6_wildcard_keeps_family() {
        let pcb = Pcb::new(PcbId(1), sock("[::1]:80"));
        assert_eq!(pcb.tuple().faddr, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn core_connect_and_disconnect() {
        let mut pcb = Pcb::new(PcbId(1), sock("10.0.0.1:80"));
        pcb.connect(sock("10.0.0.2:5000"));
        assert!(!pcb.tuple().is_wildcard());
        assert_eq!(pcb.tuple().foreign(), sock("10.0.0.2:5000"));
        assert_eq!(pcb.tuple().local(), sock("10.0.0.1:80"));
        pcb.disconnect();
        assert!(pcb.tuple().is_wildcard());
        assert_eq!(pcb.tuple().local(), sock("10.0.0.1:80"));
    }

    #[test]
    fn core_set_tuple_replaces_both_endpoints() {
        let mut pcb = Pcb::new(PcbId(1), sock("10.0.0.1:80"));
        pcb.set_tuple(PcbTuple::new(sock("10.0.0.9:443"), sock("10.0.0.2:5000")));
        assert_eq!(pcb.tuple().local(), sock("10.0.0.9:443"));
        assert_eq!(pcb.tuple().foreign(), sock("10.0.0.2:5000"));
        pcb.set_local(sock("10.0.0.1:80"));
        assert_eq!(pcb.tuple().foreign(), sock("10.0.0.2:5000"));
    }

    #[test]
    fn core_dropped_wildcard_not_needed() {
        let mut pcb = Pcb::new(PcbId(1), sock("0.0.0.0:53"));
        pcb.mark_dropped();
        assert!(!pcb.wildcard_needed());
    }

    #[test]
    fn core_inbound_tuple_orientation() {
        let t = PcbTuple::from_inbound(sock("10.0.0.2:5000"), sock("10.0.0.1:80"));
        assert_eq!(t.local(), sock("10.0.0.1:80"));
        assert_eq!(t.foreign(), sock("10.0.0.2:5000"));
    }
}
