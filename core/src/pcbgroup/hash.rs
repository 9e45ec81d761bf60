//! Group selection.
//!
//! Maps a connection's addressing information, or a flow hash already computed by the NIC, to the
//! group that owns it. The mapping is a pure function of its inputs and the configured
//! [HashFields](HashFields), so every core that sees a packet for a given flow agrees on where
//! that flow lives.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Header fields that take part in group selection.
///
/// ## Example
/// ```toml
/// [pcbgroup]
///     hash_fields = "four_tuple"
/// ```
#[derive(Debug, Default, Copy, Clone, Hash, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFields {
    /// No fields. The protocol opts out of connection groups.
    None,
    /// Foreign and local address.
    TwoTuple,
    /// Foreign address and foreign port.
    #[default]
    FourTuple,
}

impl fmt::Display for HashFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashFields::None => write!(f, "none"),
            HashFields::TwoTuple => write!(f, "2-tuple"),
            HashFields::FourTuple => write!(f, "4-tuple"),
        }
    }
}

/// Kind of flow hash attached to a received packet.
///
/// Mirrors the hash types a NIC reports alongside its receive-side scaling result.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub enum FlowHashType {
    /// No hash was computed.
    None,
    /// A hash of unknown composition (e.g., software assigned flow ID).
    Opaque,
    /// RSS over IPv4 source and destination addresses.
    RssIpv4,
    /// RSS over the IPv4 TCP 4-tuple.
    RssTcpIpv4,
    /// RSS over the IPv4 UDP 4-tuple.
    RssUdpIpv4,
    /// RSS over IPv6 source and destination addresses.
    RssIpv6,
    /// RSS over the IPv6 TCP 4-tuple.
    RssTcpIpv6,
    /// RSS over the IPv6 UDP 4-tuple.
    RssUdpIpv6,
}

impl FlowHashType {
    /// Returns `true` if the hash was computed by RSS hardware.
    pub fn is_rss(&self) -> bool {
        !matches!(self, FlowHashType::None | FlowHashType::Opaque)
    }
}

/// A flow hint: hash type and value reported with a packet.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowHash {
    pub hash_type: FlowHashType,
    pub value: u32,
}

impl FlowHash {
    pub fn new(hash_type: FlowHashType, value: u32) -> Self {
        FlowHash { hash_type, value }
    }
}

impl fmt::Display for FlowHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:0x{:08x}", self.hash_type, self.value)
    }
}

/// Identifies one connection group.
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Serialize)]
pub struct GroupIndex(pub usize);

impl GroupIndex {
    pub fn raw(&self) -> usize {
        self.0
    }
}

impl fmt::Display for GroupIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Folds an address into the 32 bits used for hashing.
///
/// IPv6 addresses contribute their low-order word.
#[inline]
pub(crate) fn addr32(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            u32::from_be_bytes([o[12], o[13], o[14], o[15]])
        }
    }
}

/// Computes the 32-bit group hash of a connection.
pub fn tuple_hash(
    fields: HashFields,
    laddr: IpAddr,
    _lport: u16,
    faddr: IpAddr,
    fport: u16,
) -> u32 {
    match fields {
        HashFields::FourTuple => addr32(faddr) ^ u32::from(fport),
        HashFields::TwoTuple => addr32(faddr) ^ addr32(laddr),
        HashFields::None => 0,
    }
}

/// Maps hashes to group indices for a fixed group count.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct BucketSelector {
    pub(crate) fields: HashFields,
    pub(crate) group_count: usize,
}

impl BucketSelector {
    pub(crate) fn new(fields: HashFields, group_count: usize) -> Self {
        BucketSelector {
            fields,
            group_count,
        }
    }

    #[inline]
    pub(crate) fn by_tuple(&self, laddr: IpAddr, lport: u16, faddr: IpAddr, fport: u16) -> GroupIndex {
        debug_assert!(self.group_count > 0, "group selection with grouping disabled");
        let hash = tuple_hash(self.fields, laddr, lport, faddr, fport);
        GroupIndex(hash as usize % self.group_count.max(1))
    }

    /// Hardware flow hashes (Toeplitz RSS) are not [tuple_hash](tuple_hash) values, so a group
    /// taken from one need not be the group the connection was placed in. No hint is usable for
    /// selection; callers select by tuple.
    #[inline]
    pub(crate) fn by_flow_hint(&self, _hint: FlowHash) -> Option<GroupIndex> {
        None
    }
}
