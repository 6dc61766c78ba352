use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use super::{ReplicaManager, ReplicaStatus};
use crate::{
    segment::{Segment, SegmentHandle, SegmentId},
    utils::{countblock::Countblock, failpoint},
    OpCode,
};

/// in-memory stand-in for the backups, replicas become durable as soon as they are submitted
/// unless held, and failures can be scripted
pub struct MemReplicas {
    replicas: DashMap<u64, ReplicaStatus>,
    /// number of upcoming submissions which will fail
    fail_next: AtomicU32,
    held: AtomicBool,
    submitted: AtomicU64,
    sem: Countblock,
}

impl Default for MemReplicas {
    fn default() -> Self {
        Self::new()
    }
}

impl MemReplicas {
    pub fn new() -> Self {
        Self {
            replicas: DashMap::new(),
            fail_next: AtomicU32::new(0),
            held: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            sem: Countblock::new(0),
        }
    }

    /// the next `n` submitted replicas will fail
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Relaxed);
    }

    /// keep submitted replicas pending until [`Self::release`]
    pub fn hold(&self) {
        self.held.store(true, Relaxed);
    }

    pub fn release(&self) {
        self.held.store(false, Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Relaxed)
    }

    /// block until one more submission happened, false on timeout
    pub fn wait_submitted(&self, timeout: Duration) -> bool {
        self.sem.wait_for(timeout)
    }

    pub fn is_durable(&self, handle: SegmentHandle) -> bool {
        self.status(handle) == ReplicaStatus::Durable
    }

    /// number of segment versions with a replica
    pub fn tracked(&self) -> usize {
        self.replicas.len()
    }
}

impl ReplicaManager for MemReplicas {
    fn submit(&self, segment: &Arc<Segment>) -> Result<(), OpCode> {
        failpoint::check("replica_submit").map_err(|_| OpCode::ReplicaFailed)?;
        if !segment.is_closed() {
            log::error!("replicate open segment {}", segment.handle());
            return Err(OpCode::Invalid);
        }

        let fail = self
            .fail_next
            .fetch_update(Relaxed, Relaxed, |x| x.checked_sub(1))
            .is_ok();
        let status = if fail {
            ReplicaStatus::Failed
        } else {
            ReplicaStatus::Pending
        };
        self.replicas.insert(segment.handle().pack(), status);
        self.submitted.fetch_add(1, Relaxed);
        self.sem.post();
        Ok(())
    }

    fn status(&self, handle: SegmentHandle) -> ReplicaStatus {
        let Some(mut s) = self.replicas.get_mut(&handle.pack()) else {
            return ReplicaStatus::Unknown;
        };
        if *s == ReplicaStatus::Pending && !self.held.load(Relaxed) {
            *s = ReplicaStatus::Durable;
        }
        *s
    }

    fn drop_replicas(&self, id: SegmentId) {
        self.replicas.retain(|k, _| SegmentHandle::unpack(*k).id != id);
    }
}

#[cfg(test)]
mod test {
    use super::MemReplicas;
    use crate::{
        segment::{Segment, SegmentHandle},
        store::{ReplicaManager, ReplicaStatus},
        OpCode,
    };
    use std::{sync::Arc, time::Duration};

    fn closed(id: u32) -> Arc<Segment> {
        let s = Arc::new(Segment::new(SegmentHandle::new(id, 0), 0, 64, vec![id]));
        s.close();
        s
    }

    #[test]
    fn scripted_failure() {
        let r = MemReplicas::new();
        r.fail_next(1);
        let (a, b) = (closed(1), closed(2));
        r.submit(&a).unwrap();
        r.submit(&b).unwrap();
        assert_eq!(r.status(a.handle()), ReplicaStatus::Failed);
        assert_eq!(
            r.wait_durable(a.handle(), Duration::from_millis(10)),
            Err(OpCode::ReplicaFailed)
        );
        assert!(r.is_durable(b.handle()));
        assert_eq!(r.status(SegmentHandle::new(9, 0)), ReplicaStatus::Unknown);
    }

    #[test]
    fn held_until_released() {
        let r = Arc::new(MemReplicas::new());
        r.hold();
        let a = closed(1);
        r.submit(&a).unwrap();
        assert!(r.wait_submitted(Duration::from_secs(1)));
        assert_eq!(r.status(a.handle()), ReplicaStatus::Pending);
        assert_eq!(
            r.wait_durable(a.handle(), Duration::from_millis(5)),
            Err(OpCode::ReplicaFailed)
        );

        let r2 = r.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            r2.release();
        });
        r.wait_durable(a.handle(), Duration::from_secs(5)).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn dropped_with_segment_id() {
        let r = MemReplicas::new();
        let a = closed(1);
        let b = Arc::new(Segment::new(SegmentHandle::new(1, 1), 0, 64, vec![2]));
        b.close();
        let c = closed(3);
        for s in [&a, &b, &c] {
            r.submit(s).unwrap();
        }
        assert_eq!(r.tracked(), 3);

        r.drop_replicas(1);
        assert_eq!(r.tracked(), 1);
        assert_eq!(r.status(a.handle()), ReplicaStatus::Unknown);
        assert_eq!(r.status(b.handle()), ReplicaStatus::Unknown);
        assert!(r.is_durable(c.handle()));
    }

    #[test]
    fn open_segment_rejected() {
        let r = MemReplicas::new();
        let s = Arc::new(Segment::new(SegmentHandle::new(1, 0), 0, 64, vec![1]));
        assert_eq!(r.submit(&s), Err(OpCode::Invalid));
    }
}
