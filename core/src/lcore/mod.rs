//! Processor identifiers and topology.

mod pin;

pub use pin::pin_thread_to_core;

use std::fmt;
use std::thread;

use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct CoreId(pub u32);

impl CoreId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the number of processors the calling thread may run on.
///
/// Reads the scheduler affinity mask. If it cannot be read, falls back to the standard library's
/// estimate, and finally to `1`.
pub fn online_cores() -> usize {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(cpu_set) => {
            let count = (0..CpuSet::count())
                .filter(|cpu| cpu_set.is_set(*cpu).unwrap_or(false))
                .count();
            if count > 0 {
                return count;
            }
        }
        Err(e) => log::warn!("Failed to read CPU affinity: {}", e),
    }
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Returns the identifiers of the processors the calling thread may run on.
pub fn online_core_ids() -> Vec<CoreId> {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(cpu_set) => (0..CpuSet::count())
            .filter(|cpu| cpu_set.is_set(*cpu).unwrap_or(false))
            .map(|cpu| CoreId(cpu as u32))
            .collect(),
        Err(_) => (0..online_cores() as u32).map(CoreId).collect(),
    }
}
