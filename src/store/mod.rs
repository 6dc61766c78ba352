//! interfaces of the collaborators the cleaner works with, plus in-memory implementations of them

use std::{sync::Arc, time::Duration};

use crate::{
    segment::{EntryRef, EntryView, Segment, SegmentHandle, SegmentId, SegmentInfo},
    OpCode,
};

pub(crate) mod directory;
pub(crate) mod index;
pub(crate) mod replica;

pub use directory::MemDirectory;
pub use index::KeyIndex;
pub use replica::MemReplicas;

/// owner of every segment and seglet, the cleaner only asks it to allocate and free
pub trait SegmentDirectory: Send + Sync {
    /// bytes of a full segment
    fn segment_size(&self) -> u32;

    fn seglet_size(&self) -> u32;

    /// current log timestamp, used to age segments
    fn now(&self) -> u32;

    /// closed segments which may be cleaned, in no particular order
    fn closed_segments(&self) -> Vec<SegmentInfo>;

    /// validate `handle` and return the segment, [`OpCode::Stale`] if it was freed or compacted
    fn segment(&self, handle: SegmentHandle) -> Result<Arc<Segment>, OpCode>;

    /// percent of usable memory occupied by segments
    fn memory_utilization(&self) -> u32;

    /// percent of backup disk space occupied by segments
    fn disk_utilization(&self) -> u32;

    /// set aside `count` full segments worth of seglets for survivors
    fn reserve_survivors(&self, count: u32) -> Result<(), OpCode>;

    /// allocate a full size survivor from the reserve, when `replaces` is given the survivor is
    /// the compacted version of that segment and keeps its id
    fn alloc_survivor(&self, replaces: Option<SegmentHandle>) -> Result<Arc<Segment>, OpCode>;

    /// close the survivor and give back the seglets it doesn't use
    fn close_survivor(&self, survivor: &Arc<Segment>);

    /// drop a survivor of an aborted pass, its content is discarded
    fn discard_survivor(&self, survivor: &Arc<Segment>);

    /// replace `source` by its compacted `survivor`, `None` when nothing was live
    fn compaction_complete(
        &self,
        source: SegmentHandle,
        survivor: Option<Arc<Segment>>,
    ) -> Result<(), OpCode>;

    /// the durable `survivors` now hold everything live in `sources`, free the sources
    fn cleaning_complete(
        &self,
        sources: &[SegmentHandle],
        survivors: &[Arc<Segment>],
    ) -> Result<(), OpCode>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplicaStatus {
    Pending,
    Durable,
    Failed,
    Unknown,
}

/// replicates segments to remote backups
pub trait ReplicaManager: Send + Sync {
    fn submit(&self, segment: &Arc<Segment>) -> Result<(), OpCode>;

    fn status(&self, handle: SegmentHandle) -> ReplicaStatus;

    /// no version of segment `id` exists any more, its replicas can go
    fn drop_replicas(&self, id: SegmentId);

    /// block until the replica of `handle` is durable
    fn wait_durable(&self, handle: SegmentHandle, timeout: Duration) -> Result<(), OpCode> {
        let start = std::time::Instant::now();
        let mut pause = Duration::from_micros(50);
        loop {
            match self.status(handle) {
                ReplicaStatus::Durable => return Ok(()),
                ReplicaStatus::Failed | ReplicaStatus::Unknown => return Err(OpCode::ReplicaFailed),
                ReplicaStatus::Pending => {}
            }
            if start.elapsed() >= timeout {
                log::error!("replica of {} not durable after {:?}", handle, timeout);
                return Err(OpCode::ReplicaFailed);
            }
            std::thread::sleep(pause);
            pause = (pause * 2).min(Duration::from_millis(10));
        }
    }
}

/// knows what log entries mean, it's the single source of truth for liveness
pub trait EntryPolicy: Send + Sync {
    /// whether the entry stored at `at` is still referenced
    fn is_live(&self, at: EntryRef, entry: &EntryView<'_>) -> bool;

    /// the entry was copied from `from` to `to`, update back references, return false if the
    /// entry is no longer referenced from `from`
    fn relocate(&self, from: EntryRef, to: EntryRef, entry: &EntryView<'_>) -> bool;
}
