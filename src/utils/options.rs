use std::{ops::Deref, time::Duration};

use super::OpCode;

#[derive(Clone, Debug)]
pub struct Options {
    /// when no cleaning work was due, sleep this long (milliseconds) before checking again
    pub poll_interval_ms: u64,
    /// the maximum in-memory segment utilization (percent) eligible for compaction, together with
    /// the seglet granularity it guarantees compaction never consumes more seglets than it frees,
    /// must be less than 100
    pub max_cleanable_memory_utilization: u32,
    /// start compacting once memory utilization (percent) reaches this value
    pub min_memory_utilization: u32,
    /// start disk cleaning once backup disk utilization (percent) reaches this value, disk
    /// cleaning may also run when compaction becomes too expensive, see the write cost threshold
    pub min_disk_utilization: u32,
    /// the maximum live data processed by a single disk cleaning pass, unit in full segments
    pub max_live_segments_per_disk_pass: u32,
    /// full survivor segments reserved with the segment directory, must be large enough to hold
    /// [`Self::max_live_segments_per_disk_pass`] of live data under worst case fragmentation
    pub survivor_segments_to_reserve: u32,
    /// sleep this long (milliseconds) after a pass was deferred or failed
    pub backoff_ms: u64,
    /// how long (milliseconds) to wait for a survivor replica to become durable
    pub replication_timeout_ms: u64,
    /// consecutive replication failures after which disk cleaning is suspended
    pub max_replica_failures: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Self {
            poll_interval_ms: 10,
            max_cleanable_memory_utilization: 98,
            min_memory_utilization: 90,
            min_disk_utilization: 95,
            max_live_segments_per_disk_pass: 10,
            survivor_segments_to_reserve: 15,
            backoff_ms: 100,
            replication_timeout_ms: 10 * 1000, // 10s
            max_replica_failures: 3,
        }
    }

    pub fn validate(self) -> Result<ParsedOptions, OpCode> {
        if self.max_cleanable_memory_utilization == 0 || self.max_cleanable_memory_utilization >= 100
        {
            log::error!(
                "max_cleanable_memory_utilization must be in [1, 99], got {}",
                self.max_cleanable_memory_utilization
            );
            return Err(OpCode::Invalid);
        }
        if self.min_memory_utilization > 100 || self.min_disk_utilization > 100 {
            log::error!(
                "utilization thresholds must be in [0, 100], got memory {} disk {}",
                self.min_memory_utilization,
                self.min_disk_utilization
            );
            return Err(OpCode::Invalid);
        }
        if self.max_live_segments_per_disk_pass == 0 {
            log::error!("max_live_segments_per_disk_pass must be positive");
            return Err(OpCode::Invalid);
        }
        if self.survivor_segments_to_reserve < self.max_live_segments_per_disk_pass {
            log::error!(
                "survivor_segments_to_reserve {} can't hold {} segments of live data",
                self.survivor_segments_to_reserve,
                self.max_live_segments_per_disk_pass
            );
            return Err(OpCode::Invalid);
        }
        if self.poll_interval_ms == 0 || self.max_replica_failures == 0 {
            log::error!("poll_interval_ms and max_replica_failures must be positive");
            return Err(OpCode::Invalid);
        }
        Ok(ParsedOptions { inner: self })
    }
}

/// validated, immutable [`Options`]
#[derive(Clone, Debug)]
pub struct ParsedOptions {
    inner: Options,
}

impl ParsedOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    /// upper bound of live bytes relocated by one disk cleaning pass
    pub fn max_live_bytes_per_disk_pass(&self, segment_size: u32) -> u64 {
        self.max_live_segments_per_disk_pass as u64 * segment_size as u64
    }
}

impl Deref for ParsedOptions {
    type Target = Options;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
