use super::CoreId;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nix::Error;

// Pin current thread to a single core, e.g. the affinity of the group it serves
pub fn pin_thread_to_core(core: CoreId) -> Result<(), Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core.raw() as usize)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(())
}
