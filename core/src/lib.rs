//! Connection groups for multiprocessor transport stacks.
//!
//! A protocol's connection table is split into one group per processor. Each group has its own
//! hash table and lock, and a connection's group is chosen the same way the NIC's receive-side
//! scaling picks a queue, so the core that receives a packet usually finds its connection in a
//! table no other core is touching. Listening and other any-peer connections, which may receive
//! traffic on any core, live in a single wildcard table that is written only while every group
//! lock is held.
//!
//! The crate manages *membership* only. Connections are owned by the caller, which reports
//! address changes through [PcbGroups::update](pcbgroup::PcbGroups::update) and destruction
//! through [PcbGroups::remove](pcbgroup::PcbGroups::remove):
//!
//! ```rust
//! use pcbgroup_core::config::default_config;
//! use pcbgroup_core::pcbgroup::{LookupMode, Pcb, PcbGroups, PcbId, PcbTuple};
//!
//! let mut config = default_config();
//! config.pcbgroup.nb_groups = Some(4);
//! let groups = PcbGroups::from_config(&config.pcbgroup).unwrap();
//!
//! let mut pcb = Pcb::new(PcbId(1), "10.0.0.1:80".parse().unwrap());
//! pcb.connect("10.0.0.2:5000".parse().unwrap());
//! groups.update(&mut pcb, None);
//!
//! let pkt = PcbTuple::from_inbound(
//!     "10.0.0.2:5000".parse().unwrap(),
//!     "10.0.0.1:80".parse().unwrap(),
//! );
//! assert_eq!(groups.lookup(&pkt, None, LookupMode::Exact), Some(PcbId(1)));
//! groups.remove(&mut pcb);
//! ```

pub mod config;
pub mod lcore;
pub mod pcbgroup;
pub mod stats;

pub use self::lcore::CoreId;
pub use self::pcbgroup::{
    FlowHash, FlowHashType, GroupIndex, HashFields, LookupMode, Pcb, PcbGroupError, PcbGroups,
    PcbId, PcbTuple,
};
