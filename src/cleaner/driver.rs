use std::sync::Arc;

use super::{
    extract::live_sorted_entries,
    relocate::Relocator,
    select::{check_compactable, frees_space, Candidates},
    stats::Stats,
    Context,
};
use crate::{
    segment::Segment,
    utils::{failpoint, options::ParsedOptions},
    OpCode,
};

/// what a single driver iteration did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// nothing was due, the caller should wait a poll interval
    Idle,
    Compacted,
    Cleaned,
    Both,
}

/// decides every iteration between in-memory compaction, disk cleaning, both or nothing
///
/// compaction is cheap since it needs no disk I/O, but it can't free tombstones, so its cost is
/// tracked and once it gets too high (or the backups fill up) disk cleaning takes over
pub(crate) struct Driver {
    opt: Arc<ParsedOptions>,
    ctx: Context,
    write_cost_threshold: f64,
    /// compaction work since the last disk cleaning
    relocated: u64,
    freed: u64,
    replica_failures: u32,
    stats: Arc<Stats>,
}

impl Driver {
    pub(crate) fn new(
        opt: Arc<ParsedOptions>,
        ctx: Context,
        write_cost_threshold: f64,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            opt,
            ctx,
            write_cost_threshold,
            relocated: 0,
            freed: 0,
            replica_failures: 0,
            stats,
        }
    }

    /// relocated bytes per freed byte of the compactions since the last disk cleaning
    pub(crate) fn write_cost(&self) -> f64 {
        match (self.relocated, self.freed) {
            (0, _) => 0.0,
            (_, 0) => f64::INFINITY,
            (r, f) => r as f64 / f as f64,
        }
    }

    fn disk_suspended(&self) -> bool {
        self.replica_failures >= self.opt.max_replica_failures
    }

    pub(crate) fn resume_disk_cleaning(&mut self) {
        self.replica_failures = 0;
        self.stats.set_disk_suspended(false);
    }

    pub(crate) fn do_work(&mut self) -> Result<Pass, OpCode> {
        self.work().inspect_err(|e| self.failed(*e))
    }

    fn work(&mut self) -> Result<Pass, OpCode> {
        let dir = self.ctx.directory.clone();
        let mut compacted = false;
        let mut cleaned = false;

        if dir.memory_utilization() >= self.opt.min_memory_utilization {
            compacted = self.do_memory_cleaning()?;
        }

        let too_costly =
            self.write_cost_threshold > 0.0 && self.write_cost() > self.write_cost_threshold;
        let disk_full = dir.disk_utilization() >= self.opt.min_disk_utilization;
        if (too_costly || disk_full) && !self.disk_suspended() {
            cleaned = self.do_disk_cleaning()?;
        }

        Ok(match (compacted, cleaned) {
            (false, false) => Pass::Idle,
            (true, false) => Pass::Compacted,
            (false, true) => Pass::Cleaned,
            (true, true) => Pass::Both,
        })
    }

    fn failed(&mut self, e: OpCode) {
        self.stats.record_error(e);
        match e {
            OpCode::NoSpace => log::warn!("cleaning deferred, no survivor segment available"),
            OpCode::Again => log::warn!("cleaning deferred, retry later"),
            OpCode::ReplicaFailed => {
                self.replica_failures += 1;
                log::error!(
                    "survivor replication failed ({} in a row), sources kept",
                    self.replica_failures
                );
                if self.disk_suspended() {
                    log::error!("disk cleaning suspended after repeated replication failures");
                    self.stats.set_disk_suspended(true);
                }
            }
            e => log::error!("cleaning pass aborted, error {}", e),
        }
    }

    /// compact the best in-memory candidate, return false if there was none
    fn do_memory_cleaning(&mut self) -> Result<bool, OpCode> {
        let dir = &*self.ctx.directory;
        let policy = &*self.ctx.policy;
        let max_util = self.opt.max_cleanable_memory_utilization;

        let candidates = Candidates::refresh(dir);
        let Some(info) = candidates.segment_to_compact(max_util) else {
            log::debug!("nothing to compact among {} segments", candidates.len());
            return Ok(false);
        };
        check_compactable(&info, max_util)?;

        let ex = live_sorted_entries(dir, policy, &[info])?;
        let seglet = dir.seglet_size() as u64;
        if ex.live_bytes.div_ceil(seglet) >= info.seglets as u64 {
            log::error!(
                "segment {} has {} live bytes, compaction can't free a seglet",
                info.handle,
                ex.live_bytes
            );
            return Err(OpCode::Invariant);
        }

        let mut r = Relocator::new(dir, policy, Some(info.handle));
        let survivor = match r.relocate(&ex).and_then(|_| r.finish()).and_then(|_| {
            let survivor = r.survivors().first().cloned();
            dir.compaction_complete(info.handle, survivor.clone())?;
            Ok(survivor)
        }) {
            Ok(x) => x,
            Err(e) => {
                r.rollback(&ex);
                return Err(e);
            }
        };

        if survivor.is_none() {
            self.ctx.replicas.drop_replicas(info.handle.id);
        }
        let kept = survivor.as_ref().map(|s| s.seglet_count()).unwrap_or(0);
        let freed = info.seglets.saturating_sub(kept) as u64;
        self.relocated += r.bytes();
        self.freed += freed * seglet;

        let s = &self.stats;
        Stats::add(&s.compaction_passes, 1);
        Stats::add(&s.entries_relocated, r.entries());
        Stats::add(&s.bytes_relocated, r.bytes());
        Stats::add(&s.segments_freed, 1);
        Stats::add(&s.survivors_created, survivor.is_some() as u64);
        Stats::add(&s.survivor_bytes, kept as u64 * seglet);
        Stats::add(&s.seglets_freed, freed);
        s.set_write_cost(self.write_cost());

        log::info!(
            "compacted {} ({}% of {} seglets) into {} seglets, {} entries {} bytes, write cost {:.3}",
            info.handle,
            info.memory_utilization(),
            info.seglets,
            kept,
            r.entries(),
            r.bytes(),
            self.write_cost()
        );
        Ok(true)
    }

    /// clean a set of segments into new durable survivors, return false if nothing was selected or
    /// the selected set can't be packed into less space
    fn do_disk_cleaning(&mut self) -> Result<bool, OpCode> {
        let dir = &*self.ctx.directory;
        let policy = &*self.ctx.policy;
        let max_live = self.opt.max_live_bytes_per_disk_pass(dir.segment_size());

        let candidates = Candidates::refresh(dir);
        let segs = candidates.segments_to_clean(max_live);
        if segs.is_empty() {
            log::debug!("nothing worth cleaning among {} segments", candidates.len());
            return Ok(false);
        }

        let ex = live_sorted_entries(dir, policy, &segs)?;
        if ex.live_bytes > max_live {
            log::error!(
                "{} live bytes exceed the per pass limit {}",
                ex.live_bytes,
                max_live
            );
            return Err(OpCode::Invariant);
        }

        let seglet = dir.seglet_size() as u64;
        let source_seglets: u64 = segs.iter().map(|x| x.seglets as u64).sum();
        let (survivors, survivor_seglets) = ex.packed(dir.segment_size(), dir.seglet_size())?;
        if !frees_space(segs.len(), source_seglets, survivors, survivor_seglets) {
            log::debug!(
                "{} segments would need {} survivors of {} seglets, skip",
                segs.len(),
                survivors,
                survivor_seglets
            );
            return Ok(false);
        }

        let sources = ex.handles();
        let mut r = Relocator::new(dir, policy, None);
        let res = r
            .relocate(&ex)
            .and_then(|_| r.finish())
            .and_then(|_| self.replicate(r.survivors()))
            .and_then(|_| failpoint::check("cleaner_before_free"))
            .and_then(|_| dir.cleaning_complete(&sources, r.survivors()));
        if let Err(e) = res {
            for s in r.survivors() {
                self.ctx.replicas.drop_replicas(s.id());
            }
            r.rollback(&ex);
            return Err(e);
        }
        for h in &sources {
            self.ctx.replicas.drop_replicas(h.id);
        }
        r.release_dead_tombstones();

        let kept: u64 = r.survivors().iter().map(|x| x.seglet_count() as u64).sum();

        self.relocated = 0;
        self.freed = 0;
        self.replica_failures = 0;

        let s = &self.stats;
        Stats::add(&s.disk_passes, 1);
        Stats::add(&s.entries_relocated, r.entries());
        Stats::add(&s.bytes_relocated, r.bytes());
        Stats::add(&s.segments_freed, sources.len() as u64);
        Stats::add(&s.survivors_created, r.survivors().len() as u64);
        Stats::add(&s.survivor_bytes, kept * seglet);
        Stats::add(&s.seglets_freed, source_seglets.saturating_sub(kept));
        s.set_write_cost(0.0);
        s.set_disk_suspended(false);

        log::info!(
            "cleaned {} segments into {} survivors, {} entries {} bytes",
            sources.len(),
            r.survivors().len(),
            r.entries(),
            r.bytes()
        );
        Ok(true)
    }

    /// submit every survivor, then wait for all of them to be durable
    fn replicate(&self, survivors: &[Arc<Segment>]) -> Result<(), OpCode> {
        let replicas = &*self.ctx.replicas;
        for s in survivors {
            replicas.submit(s)?;
        }
        let timeout = self.opt.replication_timeout();
        for s in survivors {
            replicas.wait_durable(s.handle(), timeout)?;
        }
        Ok(())
    }
}
