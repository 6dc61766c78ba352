use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering::Relaxed},
        Arc,
    },
};

use super::SegmentDirectory;
use crate::{
    segment::{
        EntryHeader, EntryKind, EntryRef, SegletId, Segment, SegmentHandle, SegmentId, SegmentInfo,
    },
    utils::{failpoint, percent},
    OpCode,
};

struct Pool {
    free: Vec<SegletId>,
    reserve: Vec<SegletId>,
    /// seglets the reserve is refilled up to
    reserve_target: usize,
}

impl Pool {
    fn take_free(&mut self, count: usize) -> Option<Vec<SegletId>> {
        if self.free.len() < count {
            return None;
        }
        let at = self.free.len() - count;
        Some(self.free.split_off(at))
    }

    fn take_reserve(&mut self, count: usize) -> Option<Vec<SegletId>> {
        if self.reserve.len() < count {
            return None;
        }
        let at = self.reserve.len() - count;
        Some(self.reserve.split_off(at))
    }

    /// freed seglets refill the survivor reserve first
    fn give_back(&mut self, seglets: Vec<SegletId>) {
        for s in seglets {
            if self.reserve.len() < self.reserve_target {
                self.reserve.push(s);
            } else {
                self.free.push(s);
            }
        }
    }

    fn refill(&mut self) {
        while self.reserve.len() < self.reserve_target {
            match self.free.pop() {
                Some(s) => self.reserve.push(s),
                None => break,
            }
        }
    }
}

/// an in-memory segment directory: a fixed pool of seglets, a survivor reserve and a log head
/// which appends go to
pub struct MemDirectory {
    segment_size: u32,
    seglet_size: u32,
    total_seglets: u32,
    /// backup capacity, in full segments
    disk_segments: u32,
    segments: DashMap<u64, Arc<Segment>>,
    pool: Mutex<Pool>,
    head: Mutex<Option<Arc<Segment>>>,
    next_id: AtomicU32,
    clock: AtomicU32,
}

impl MemDirectory {
    pub fn new(
        segment_size: u32,
        seglet_size: u32,
        total_seglets: u32,
        disk_segments: u32,
    ) -> Result<Self, OpCode> {
        if seglet_size < EntryHeader::LEN as u32
            || segment_size < seglet_size
            || segment_size % seglet_size != 0
            || total_seglets < segment_size / seglet_size
            || disk_segments == 0
        {
            log::error!(
                "invalid geometry: segment {} seglet {} total {} disk {}",
                segment_size,
                seglet_size,
                total_seglets,
                disk_segments
            );
            return Err(OpCode::Invalid);
        }
        Ok(Self {
            segment_size,
            seglet_size,
            total_seglets,
            disk_segments,
            segments: DashMap::new(),
            pool: Mutex::new(Pool {
                free: (0..total_seglets).rev().collect(),
                reserve: Vec::new(),
                reserve_target: 0,
            }),
            head: Mutex::new(None),
            next_id: AtomicU32::new(1),
            clock: AtomicU32::new(0),
        })
    }

    fn seglets_per_segment(&self) -> usize {
        (self.segment_size / self.seglet_size) as usize
    }

    pub fn advance_clock(&self, by: u32) -> u32 {
        self.clock.fetch_add(by, Relaxed).wrapping_add(by)
    }

    /// append an entry at the log head, opening a new head when the current one is full
    pub fn append(&self, kind: EntryKind, payload: &[u8]) -> Result<EntryRef, OpCode> {
        if EntryHeader::LEN + payload.len() > self.segment_size as usize {
            return Err(OpCode::TooLarge);
        }
        let mut head = self.head.lock();
        loop {
            if let Some(h) = head.as_ref() {
                match h.append(kind, self.now(), payload) {
                    Ok(off) => return Ok(EntryRef::new(h.handle(), off)),
                    Err(OpCode::NoSpace) => {
                        h.close();
                        *head = None;
                    }
                    Err(e) => return Err(e),
                }
            }
            *head = Some(self.open_head()?);
        }
    }

    fn open_head(&self) -> Result<Arc<Segment>, OpCode> {
        let seglets = self
            .pool
            .lock()
            .take_free(self.seglets_per_segment())
            .ok_or(OpCode::NoSpace)?;
        let id = self.next_id.fetch_add(1, Relaxed);
        let seg = Arc::new(Segment::new(
            SegmentHandle::new(id, 0),
            self.now(),
            self.seglet_size,
            seglets,
        ));
        self.segments.insert(seg.handle().pack(), seg.clone());
        log::debug!("open log head {}", seg.handle());
        Ok(seg)
    }

    /// close the log head so it becomes a cleaning candidate
    pub fn roll_head(&self) {
        let Some(h) = self.head.lock().take() else {
            return;
        };
        h.close();
        if h.is_empty() {
            self.segments.remove(&h.handle().pack());
            self.pool.lock().give_back(h.take_seglets());
        }
    }

    pub fn head(&self) -> Option<SegmentHandle> {
        self.head.lock().as_ref().map(|x| x.handle())
    }

    /// the entry at `at` is no longer referenced
    pub fn mark_dead(&self, at: EntryRef) {
        let Ok(seg) = self.segment(at.segment) else {
            return;
        };
        match seg.entry_len(at.offset) {
            Ok(len) => seg.mark_dead(len),
            Err(e) => log::warn!("can't account dead entry {:?}, error {}", at, e),
        }
    }

    /// whether some version of segment `id` is still stored
    pub fn contains_id(&self, id: SegmentId) -> bool {
        self.segments.iter().any(|x| x.value().id() == id)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn free_seglets(&self) -> usize {
        self.pool.lock().free.len()
    }

    pub fn reserved_seglets(&self) -> usize {
        self.pool.lock().reserve.len()
    }

    fn used_seglets(&self) -> u64 {
        self.segments
            .iter()
            .map(|x| x.value().seglet_count() as u64)
            .sum()
    }

    fn remove(&self, handle: SegmentHandle) -> Result<Arc<Segment>, OpCode> {
        let (_, seg) = self.segments.remove(&handle.pack()).ok_or_else(|| {
            log::error!("segment {} is not in directory", handle);
            OpCode::Stale
        })?;
        self.pool.lock().give_back(seg.take_seglets());
        Ok(seg)
    }
}

impl SegmentDirectory for MemDirectory {
    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    fn now(&self) -> u32 {
        self.clock.load(Relaxed)
    }

    fn closed_segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .iter()
            .filter(|x| x.value().is_closed())
            .map(|x| x.value().info(self.segment_size))
            .collect()
    }

    fn segment(&self, handle: SegmentHandle) -> Result<Arc<Segment>, OpCode> {
        self.segments
            .get(&handle.pack())
            .map(|x| x.value().clone())
            .ok_or(OpCode::Stale)
    }

    fn memory_utilization(&self) -> u32 {
        let reserved = self.reserved_seglets() as u64;
        percent(
            self.used_seglets(),
            (self.total_seglets as u64).saturating_sub(reserved),
        )
    }

    fn disk_utilization(&self) -> u32 {
        let ids: HashSet<SegmentId> = self.segments.iter().map(|x| x.value().id()).collect();
        percent(ids.len() as u64, self.disk_segments as u64)
    }

    fn reserve_survivors(&self, count: u32) -> Result<(), OpCode> {
        let target = count as usize * self.seglets_per_segment();
        let mut pool = self.pool.lock();
        if pool.reserve.len() + pool.free.len() < target {
            log::error!(
                "can't reserve {} survivors, only {} seglets available",
                count,
                pool.reserve.len() + pool.free.len()
            );
            return Err(OpCode::NoSpace);
        }
        pool.reserve_target = target;
        pool.refill();
        while pool.reserve.len() > target {
            if let Some(s) = pool.reserve.pop() {
                pool.free.push(s);
            }
        }
        Ok(())
    }

    fn alloc_survivor(&self, replaces: Option<SegmentHandle>) -> Result<Arc<Segment>, OpCode> {
        failpoint::check("survivor_alloc").map_err(|_| OpCode::NoSpace)?;

        let (handle, created) = match replaces {
            Some(h) => (h.next_generation(), self.segment(h)?.created()),
            None => (
                SegmentHandle::new(self.next_id.fetch_add(1, Relaxed), 0),
                self.now(),
            ),
        };
        let seglets = self
            .pool
            .lock()
            .take_reserve(self.seglets_per_segment())
            .ok_or(OpCode::NoSpace)?;
        let seg = Arc::new(Segment::new(handle, created, self.seglet_size, seglets));
        self.segments.insert(handle.pack(), seg.clone());
        Ok(seg)
    }

    fn close_survivor(&self, survivor: &Arc<Segment>) {
        survivor.close();
        let unused = survivor.shrink();
        self.pool.lock().give_back(unused);
    }

    fn discard_survivor(&self, survivor: &Arc<Segment>) {
        survivor.close();
        self.segments.remove(&survivor.handle().pack());
        self.pool.lock().give_back(survivor.take_seglets());
    }

    fn compaction_complete(
        &self,
        source: SegmentHandle,
        survivor: Option<Arc<Segment>>,
    ) -> Result<(), OpCode> {
        if let Some(s) = survivor.as_ref() {
            if !s.is_closed() || !self.segments.contains_key(&s.handle().pack()) {
                log::error!("survivor {} is not installed", s.handle());
                return Err(OpCode::Invalid);
            }
        }
        self.remove(source)?;
        self.pool.lock().refill();
        Ok(())
    }

    fn cleaning_complete(
        &self,
        sources: &[SegmentHandle],
        survivors: &[Arc<Segment>],
    ) -> Result<(), OpCode> {
        if let Some(s) = survivors
            .iter()
            .find(|s| !s.is_closed() || !self.segments.contains_key(&s.handle().pack()))
        {
            log::error!("survivor {} is not installed", s.handle());
            return Err(OpCode::Invalid);
        }
        // all or nothing, a failed pass points references back into the sources
        if let Some(h) = sources
            .iter()
            .find(|h| !self.segments.contains_key(&h.pack()))
        {
            log::error!("source {} is not in directory", h);
            return Err(OpCode::Stale);
        }
        for &h in sources {
            self.remove(h)?;
        }
        self.pool.lock().refill();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::MemDirectory;
    use crate::{segment::EntryKind, store::SegmentDirectory, OpCode};

    #[test]
    fn head_rolls_when_full() {
        let d = MemDirectory::new(256, 64, 16, 8).unwrap();
        let payload = [1u8; 112]; // 128 bytes with header
        let a = d.append(EntryKind::Object, &payload).unwrap();
        let b = d.append(EntryKind::Object, &payload).unwrap();
        let c = d.append(EntryKind::Object, &payload).unwrap();
        assert_eq!(a.segment, b.segment);
        assert_ne!(b.segment, c.segment);
        assert_eq!(d.closed_segments().len(), 1);
        assert_eq!(d.memory_utilization(), 50);
        assert_eq!(d.disk_utilization(), 25);

        d.roll_head();
        assert_eq!(d.closed_segments().len(), 2);
        assert!(d.head().is_none());
    }

    #[test]
    fn reserve_and_survivors() {
        let d = MemDirectory::new(256, 64, 12, 8).unwrap();
        d.reserve_survivors(2).unwrap();
        assert_eq!(d.reserved_seglets(), 8);
        assert_eq!(d.free_seglets(), 4);
        assert_eq!(d.reserve_survivors(4), Err(OpCode::NoSpace));
        d.reserve_survivors(2).unwrap();

        let s = d.alloc_survivor(None).unwrap();
        s.append(EntryKind::Object, 0, &[0u8; 10]).unwrap();
        d.close_survivor(&s);
        assert_eq!(s.seglet_count(), 1);
        // released seglets go back to the reserve first
        assert_eq!(d.reserved_seglets(), 7);

        d.discard_survivor(&s);
        assert_eq!(d.reserved_seglets(), 8);
        assert_eq!(d.segment(s.handle()).err(), Some(OpCode::Stale));
    }

    #[test]
    fn compaction_keeps_id() {
        let d = MemDirectory::new(256, 64, 16, 8).unwrap();
        d.reserve_survivors(1).unwrap();
        let r = d.append(EntryKind::Object, b"x").unwrap();
        d.roll_head();

        let s = d.alloc_survivor(Some(r.segment)).unwrap();
        assert_eq!(s.id(), r.segment.id);
        assert_eq!(s.handle().generation, 1);
        d.close_survivor(&s);
        d.compaction_complete(r.segment, Some(s.clone())).unwrap();

        assert_eq!(d.segment(r.segment).err(), Some(OpCode::Stale));
        assert!(d.contains_id(r.segment.id));
        assert_eq!(
            d.compaction_complete(r.segment, None),
            Err(OpCode::Stale)
        );
    }

    #[test]
    fn cleaning_frees_all_sources_or_none() {
        let d = MemDirectory::new(256, 64, 16, 8).unwrap();
        d.reserve_survivors(1).unwrap();
        let a = d.append(EntryKind::Object, b"a").unwrap().segment;
        d.roll_head();
        let b = d.append(EntryKind::Object, b"b").unwrap().segment;
        d.roll_head();

        let s = d.alloc_survivor(None).unwrap();
        d.close_survivor(&s);
        let gone = b.next_generation();
        assert_eq!(
            d.cleaning_complete(&[a, gone, b], &[s.clone()]),
            Err(OpCode::Stale)
        );
        assert!(d.segment(a).is_ok());
        assert!(d.segment(b).is_ok());

        d.cleaning_complete(&[a, b], &[s.clone()]).unwrap();
        assert_eq!(d.segment(a).err(), Some(OpCode::Stale));
        assert_eq!(d.segment(b).err(), Some(OpCode::Stale));
        assert!(d.segment(s.handle()).is_ok());
    }

    #[test]
    fn bad_geometry() {
        assert!(MemDirectory::new(100, 64, 16, 8).is_err());
        assert!(MemDirectory::new(256, 8, 64, 8).is_err());
        assert!(MemDirectory::new(256, 64, 2, 8).is_err());
    }
}
