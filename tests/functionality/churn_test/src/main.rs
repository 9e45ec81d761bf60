use anyhow::{anyhow, bail, Result};
use clap::Parser;
use pcbgroup_core::config::load_config;
use pcbgroup_core::lcore::pin_thread_to_core;
use pcbgroup_core::pcbgroup::Membership;
use pcbgroup_core::stats::{self, PcbGroupStats};
use pcbgroup_core::{
    FlowHash, FlowHashType, GroupIndex, LookupMode, Pcb, PcbGroups, PcbId, PcbTuple,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

// Drives one worker per connection group through random connection state changes, then checks
// that every table entry is claimed by exactly one connection in the group its tuple selects.

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: PathBuf,
    /// State changes per worker.
    #[clap(long, default_value = "100000")]
    ops: usize,
    /// Connections owned by each worker.
    #[clap(long, default_value = "256")]
    pcbs: u64,
    /// Pin each worker to its group's processor.
    #[clap(long)]
    pin: bool,
    #[clap(
        short,
        long,
        parse(from_os_str),
        value_name = "FILE",
        default_value = "churn_stats.jsonl"
    )]
    outfile: PathBuf,
}

#[derive(Debug, serde::Serialize)]
struct WorkerResult {
    group: usize,
    ops: usize,
    lookup_misses: usize,
    elapsed_ms: u128,
    stats: PcbGroupStats,
}

fn addr(raw: u32, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port)
}

/// Applies one random state change or lookup to `pcb`. Returns `false` if a lookup for a grouped
/// connection missed.
fn churn(groups: &PcbGroups, pcb: &mut Pcb, rng: &mut StdRng) -> bool {
    match rng.random_range(0..16) {
        0..=5 => {
            let faddr = 0xc0a8_0000 + rng.random_range(0..1u32 << 16);
            pcb.connect(addr(faddr, rng.random_range(1024..61_024)));
            groups.update(pcb, None);
        }
        6 | 7 => {
            let hint = FlowHash::new(FlowHashType::RssTcpIpv4, rng.random());
            groups.update(pcb, Some(hint));
        }
        8 | 9 => {
            pcb.disconnect();
            groups.update(pcb, None);
        }
        10 => {
            pcb.mark_dropped();
            groups.update(pcb, None);
            groups.remove(pcb);
            *pcb = Pcb::new(pcb.id(), pcb.tuple().local());
            groups.update(pcb, None);
        }
        11 => groups.remove(pcb),
        _ => {
            if pcb.group().is_some() {
                let t = *pcb.tuple();
                let pkt = PcbTuple::from_inbound(t.foreign(), t.local());
                let hint = rng
                    .random_bool(0.5)
                    .then(|| FlowHash::new(FlowHashType::RssTcpIpv4, rng.random()));
                if groups.lookup(&pkt, hint, LookupMode::Exact) != Some(pcb.id()) {
                    log::error!("{} not found for {}", pcb.id(), pkt);
                    return false;
                }
            }
        }
    }
    true
}

fn expected_group(groups: &PcbGroups, pcb: &Pcb) -> Option<GroupIndex> {
    let t = pcb.tuple();
    if t.is_wildcard() || pcb.is_dropped() {
        return None;
    }
    Some(groups.select_group_by_tuple(t.laddr, t.lport, t.faddr, t.fport))
}

fn verify(groups: &PcbGroups, pcbs: &[Pcb]) -> Result<()> {
    let all = groups
        .lock_all()
        .ok_or_else(|| anyhow!("connection groups disabled"))?;
    let mut claimed = 0;
    for pcb in pcbs {
        let in_groups: Vec<GroupIndex> = all
            .iter()
            .filter(|(_, table)| table.contains(pcb.id()))
            .map(|(index, _)| index)
            .collect();
        let in_wild = all.wildcard().contains(pcb.id());
        match pcb.membership() {
            Membership::Group { index, .. } => {
                if Some(index) != expected_group(groups, pcb) || in_groups != [index] || in_wild {
                    bail!("{} misplaced: claims group {}, found in {:?}", pcb.id(), index, in_groups);
                }
                claimed += 1;
            }
            Membership::Wildcard { .. } => {
                if !pcb.tuple().is_wildcard() || !in_groups.is_empty() || !in_wild {
                    bail!("{} misplaced: claims wildcard, found in {:?}", pcb.id(), in_groups);
                }
                claimed += 1;
            }
            Membership::Ungrouped => {
                if !in_groups.is_empty() || in_wild {
                    bail!("{} indexed while ungrouped", pcb.id());
                }
            }
        }
    }
    let entries =
        all.iter().map(|(_, table)| table.len()).sum::<usize>() + all.wildcard().len();
    if entries != claimed {
        bail!("{} table entries, {} claimed", entries, claimed);
    }
    log::info!("Verified {} connections ({} indexed)", pcbs.len(), claimed);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.pcbs == 0 {
        bail!("--pcbs must be positive");
    }
    let config = load_config(&args.config)?;
    let mut groups = PcbGroups::from_config(&config.pcbgroup)?;
    if !groups.is_enabled() {
        log::warn!("Connection groups disabled, nothing to exercise");
        return Ok(());
    }

    let nb_workers = groups.group_count();
    let (mut pcbs, results) = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..nb_workers)
            .map(|w| {
                let groups = &groups;
                let args = &args;
                s.spawn(move |_| {
                    if args.pin {
                        if let Some(core) = groups.group_affinity(GroupIndex(w)) {
                            if let Err(e) = pin_thread_to_core(core) {
                                log::warn!("Failed to pin worker {} to core {}: {}", w, core, e);
                            }
                        }
                    }
                    stats::reset();
                    let mut rng = StdRng::seed_from_u64(w as u64);
                    let mut pcbs: Vec<Pcb> = (0..args.pcbs)
                        .map(|i| {
                            let id = PcbId(w as u64 * args.pcbs + i);
                            Pcb::new(id, addr(0x0a01_0000 + w as u32, 20_000 + (i % 40_000) as u16))
                        })
                        .collect();
                    let start = Instant::now();
                    let mut lookup_misses = 0;
                    for _ in 0..args.ops {
                        let idx = rng.random_range(0..args.pcbs) as usize;
                        if !churn(groups, &mut pcbs[idx], &mut rng) {
                            lookup_misses += 1;
                        }
                    }
                    let result = WorkerResult {
                        group: w,
                        ops: args.ops,
                        lookup_misses,
                        elapsed_ms: start.elapsed().as_millis(),
                        stats: stats::snapshot(),
                    };
                    (pcbs, result)
                })
            })
            .collect();
        let mut pcbs = Vec::new();
        let mut results = Vec::new();
        for h in handles {
            let (p, r) = h.join().map_err(|_| anyhow!("worker panicked"))?;
            pcbs.extend(p);
            results.push(r);
        }
        Ok::<_, anyhow::Error>((pcbs, results))
    })
    .map_err(|_| anyhow!("worker panicked"))??;

    let lookup_misses: usize = results.iter().map(|r| r.lookup_misses).sum();
    if lookup_misses > 0 {
        bail!("{} lookups missed a grouped connection", lookup_misses);
    }
    verify(&groups, &pcbs)?;

    let mut total = PcbGroupStats::default();
    let mut file = std::fs::File::create(&args.outfile)?;
    for result in results.iter() {
        total.merge(&result.stats);
        writeln!(file, "{}", serde_json::to_string(result)?)?;
    }
    println!("{}", serde_json::to_string_pretty(&total)?);

    for pcb in pcbs.iter_mut() {
        groups.remove(pcb);
    }
    groups.destroy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcbgroup_core::HashFields;

    #[test]
    fn churn_lookups_never_miss() {
        let groups = PcbGroups::new(HashFields::FourTuple, 64, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut pcbs: Vec<Pcb> = (0..32u16)
            .map(|i| Pcb::new(PcbId(i.into()), addr(0x0a01_0000, 20_000 + i)))
            .collect();
        let mut misses = 0;
        for _ in 0..20_000 {
            let idx = rng.random_range(0..pcbs.len());
            if !churn(&groups, &mut pcbs[idx], &mut rng) {
                misses += 1;
            }
        }
        assert_eq!(misses, 0);
        verify(&groups, &pcbs).unwrap();
        for pcb in pcbs.iter_mut() {
            groups.remove(pcb);
        }
    }
}
