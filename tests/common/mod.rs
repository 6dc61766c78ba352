#![allow(dead_code)]

use logclean::{Cleaner, Context, KeyIndex, MemDirectory, MemReplicas, OpCode, Options};
use logger::Logger;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// bytes of an object written by [`TestEnv::fill`]: 16 header, 2 klen, 6 key, 8 value
pub const ENTRY_LEN: u64 = 32;

pub struct TestEnv {
    pub dir: Arc<MemDirectory>,
    pub idx: Arc<KeyIndex>,
    pub replicas: Arc<MemReplicas>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new(32 << 10, 1 << 10, 512, 64)
    }
}

impl TestEnv {
    pub fn new(segment_size: u32, seglet_size: u32, total_seglets: u32, disk_segments: u32) -> Self {
        init_log();
        let dir = Arc::new(
            MemDirectory::new(segment_size, seglet_size, total_seglets, disk_segments).unwrap(),
        );
        Self {
            idx: Arc::new(KeyIndex::new(dir.clone())),
            dir,
            replicas: Arc::new(MemReplicas::new()),
        }
    }

    pub fn ctx(&self) -> Context {
        Context::new(self.dir.clone(), self.replicas.clone(), self.idx.clone())
    }

    /// both triggers off, tests turn on what they need
    pub fn options(&self) -> Options {
        let mut opt = Options::new();
        opt.poll_interval_ms = 1;
        opt.backoff_ms = 1;
        opt.min_memory_utilization = 100;
        opt.min_disk_utilization = 100;
        opt.max_live_segments_per_disk_pass = 2;
        opt.survivor_segments_to_reserve = 3;
        opt
    }

    pub fn cleaner_with<F>(&self, write_cost_threshold: f64, tune: F) -> Result<Cleaner, OpCode>
    where
        F: FnOnce(&mut Options),
    {
        let mut opt = self.options();
        tune(&mut opt);
        Cleaner::new(opt.validate()?, self.ctx(), write_cost_threshold)
    }

    /// put `n` keys `{prefix}{i:05}` with 8 byte values, one clock tick each
    pub fn fill(&self, prefix: char, n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                let k = key(prefix, i);
                self.dir.advance_clock(1);
                self.idx.put(&k, &value(i)).unwrap();
                k
            })
            .collect()
    }
}

pub fn key(prefix: char, i: usize) -> Vec<u8> {
    format!("{prefix}{i:05}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    (i as u64).to_le_bytes().to_vec()
}

pub fn init_log() {
    let l = Logger::init();
    if std::env::var(logger::LEVEL_ENV).is_ok() {
        l.add_console();
    }
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn wait_until<F>(timeout: Duration, step: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() <= timeout {
        if predicate() {
            return true;
        }
        std::thread::sleep(step);
    }
    false
}
