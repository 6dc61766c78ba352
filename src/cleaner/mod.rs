//! The cleaner reclaims space from closed segments by copying what is still live into survivor
//! segments, then giving the old segments back to the directory.
//!
//! Two strategies are used:
//! - compaction rewrites the sparsest segment in memory only, it's cheap but leaves the backups
//!   and therefore the tombstones untouched
//! - disk cleaning rewrites a set of segments picked by cost-benefit (free space weighted by age)
//!   into new survivors, which are replicated before the sources are freed
//!
//! Live entries are written out oldest first, so old and new data end up in different survivors.

use parking_lot::Mutex;
use std::sync::Arc;

mod driver;
mod extract;
mod relocate;
mod select;
mod stats;
mod worker;

pub use driver::Pass;
pub use stats::Statistics;
pub use worker::State;

use driver::Driver;
use stats::Stats;
use worker::{start_cleaner, Handle, Lifecycle};

use crate::{
    store::{EntryPolicy, ReplicaManager, SegmentDirectory},
    utils::options::ParsedOptions,
    OpCode,
};

/// the collaborators a cleaner works with
#[derive(Clone)]
pub struct Context {
    pub directory: Arc<dyn SegmentDirectory>,
    pub replicas: Arc<dyn ReplicaManager>,
    pub policy: Arc<dyn EntryPolicy>,
}

impl Context {
    pub fn new(
        directory: Arc<dyn SegmentDirectory>,
        replicas: Arc<dyn ReplicaManager>,
        policy: Arc<dyn EntryPolicy>,
    ) -> Self {
        Self {
            directory,
            replicas,
            policy,
        }
    }
}

pub struct Cleaner {
    opt: Arc<ParsedOptions>,
    driver: Arc<Mutex<Driver>>,
    stats: Arc<Stats>,
    life: Arc<Lifecycle>,
    worker: Mutex<Option<Handle>>,
}

impl Cleaner {
    /// `write_cost_threshold` forces disk cleaning once compaction relocates more than this many
    /// bytes per byte it frees, `0.0` disables it
    pub fn new(opt: ParsedOptions, ctx: Context, write_cost_threshold: f64) -> Result<Self, OpCode> {
        if !write_cost_threshold.is_finite() || write_cost_threshold < 0.0 {
            log::error!("invalid write cost threshold {}", write_cost_threshold);
            return Err(OpCode::Invalid);
        }
        ctx.directory
            .reserve_survivors(opt.survivor_segments_to_reserve)?;

        let opt = Arc::new(opt);
        let stats = Arc::new(Stats::default());
        let driver = Driver::new(opt.clone(), ctx, write_cost_threshold, stats.clone());
        Ok(Self {
            opt,
            driver: Arc::new(Mutex::new(driver)),
            stats,
            life: Arc::new(Lifecycle::new()),
            worker: Mutex::new(None),
        })
    }

    /// run the cleaner in a background thread, nothing happens if it's already running
    pub fn start(&self) -> Result<(), OpCode> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let prev = self.life.get();
        self.life.set(State::Running);
        match start_cleaner(self.driver.clone(), self.life.clone(), self.opt.clone()) {
            Ok(h) => {
                *worker = Some(h);
                log::info!("cleaner started");
                Ok(())
            }
            Err(e) => {
                self.life.set(prev);
                Err(e)
            }
        }
    }

    /// ask the background thread to exit and wait for it, a pass in progress is completed
    /// first, it's fine to call it when the cleaner was never started
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        let Some(h) = worker.take() else {
            return;
        };
        self.life.transit(State::Running, State::StopRequested);
        h.quit();
        self.life.set(State::Stopped);
        log::info!("cleaner stopped");
    }

    /// run a single iteration on the caller's thread
    pub fn run_once(&self) -> Result<Pass, OpCode> {
        self.driver.lock().do_work()
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    pub fn state(&self) -> State {
        self.life.get()
    }

    /// clear the suspension caused by repeated replication failures
    pub fn resume_disk_cleaning(&self) {
        self.driver.lock().resume_disk_cleaning();
        log::info!("disk cleaning resumed");
    }

    pub fn options(&self) -> &ParsedOptions {
        &self.opt
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::{Cleaner, Context, Pass, State};
    use crate::{
        store::{KeyIndex, MemReplicas, SegmentDirectory},
        MemDirectory, OpCode, Options,
    };
    use std::sync::Arc;

    struct Env {
        dir: Arc<MemDirectory>,
        idx: Arc<KeyIndex>,
        replicas: Arc<MemReplicas>,
    }

    impl Env {
        fn new() -> Self {
            let dir = Arc::new(MemDirectory::new(4096, 512, 256, 64).unwrap());
            let idx = Arc::new(KeyIndex::new(dir.clone()));
            Self {
                dir,
                idx,
                replicas: Arc::new(MemReplicas::new()),
            }
        }

        fn ctx(&self) -> Context {
            Context::new(self.dir.clone(), self.replicas.clone(), self.idx.clone())
        }

        fn options(&self) -> Options {
            let mut opt = Options::new();
            opt.survivor_segments_to_reserve = 4;
            opt.max_live_segments_per_disk_pass = 2;
            opt.min_memory_utilization = 0;
            opt.min_disk_utilization = 100;
            opt
        }
    }

    #[test]
    fn bad_threshold() {
        let env = Env::new();
        let opt = env.options().validate().unwrap();
        assert_eq!(
            Cleaner::new(opt.clone(), env.ctx(), f64::NAN).err(),
            Some(OpCode::Invalid)
        );
        assert_eq!(
            Cleaner::new(opt, env.ctx(), -1.0).err(),
            Some(OpCode::Invalid)
        );
    }

    #[test]
    fn reserve_too_large() {
        let env = Env::new();
        let mut opt = env.options();
        opt.survivor_segments_to_reserve = 64;
        assert_eq!(
            Cleaner::new(opt.validate().unwrap(), env.ctx(), 0.0).err(),
            Some(OpCode::NoSpace)
        );
    }

    #[test]
    fn idle_when_nothing_to_do() {
        let env = Env::new();
        let c = Cleaner::new(env.options().validate().unwrap(), env.ctx(), 0.0).unwrap();
        assert_eq!(c.run_once(), Ok(Pass::Idle));
        assert_eq!(c.statistics().compaction_passes, 0);
    }

    #[test]
    fn lifecycle() {
        let env = Env::new();
        let c = Cleaner::new(env.options().validate().unwrap(), env.ctx(), 0.0).unwrap();
        c.stop();
        assert_eq!(c.state(), State::Idle);

        c.start().unwrap();
        c.start().unwrap();
        assert_eq!(c.state(), State::Running);
        c.stop();
        assert_eq!(c.state(), State::Stopped);
        c.stop();

        c.start().unwrap();
        assert_eq!(c.state(), State::Running);
    }

    #[test]
    fn write_cost_forces_disk_cleaning() {
        let env = Env::new();
        let c = Cleaner::new(env.options().validate().unwrap(), env.ctx(), 0.01).unwrap();
        for i in 0..40u32 {
            env.dir.advance_clock(1);
            env.idx.put(&i.to_le_bytes(), &[1u8; 90]).unwrap();
        }
        env.dir.roll_head();
        for i in 0..30u32 {
            env.idx.del(&i.to_le_bytes()).unwrap();
        }
        env.dir.roll_head();
        // any compaction costs more than 0.01, so disk cleaning follows in the same iteration
        assert_eq!(c.run_once(), Ok(Pass::Both));
        let st = c.statistics();
        assert_eq!(st.compaction_passes, 1);
        assert_eq!(st.disk_passes, 1);
        assert_eq!(st.write_cost, 0.0);
        for i in 30..40u32 {
            assert_eq!(env.idx.get(&i.to_le_bytes()).unwrap(), Some(vec![1u8; 90]));
        }
        assert!(env
            .dir
            .closed_segments()
            .iter()
            .all(|s| s.handle.generation == 0));
    }
}
