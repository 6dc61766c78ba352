use std::sync::Arc;

use super::extract::Extracted;
use crate::{
    segment::{EntryKind, EntryRef, EntryView, Segment, SegmentHandle},
    store::{EntryPolicy, SegmentDirectory},
    OpCode,
};

/// copies live entries into survivor segments in the order given and moves the back references
/// to the copies
///
/// a relocator that failed half way must be rolled back, which points every moved reference at
/// its source again and discards the survivors
pub(crate) struct Relocator<'a> {
    dir: &'a dyn SegmentDirectory,
    policy: &'a dyn EntryPolicy,
    /// the segment being compacted, it must fit into a single survivor
    replaces: Option<SegmentHandle>,
    survivors: Vec<Arc<Segment>>,
    moved: Vec<(EntryRef, EntryRef)>,
    entries: u64,
    bytes: u64,
}

impl<'a> Relocator<'a> {
    pub(crate) fn new(
        dir: &'a dyn SegmentDirectory,
        policy: &'a dyn EntryPolicy,
        replaces: Option<SegmentHandle>,
    ) -> Self {
        Self {
            dir,
            policy,
            replaces,
            survivors: Vec::new(),
            moved: Vec::new(),
            entries: 0,
            bytes: 0,
        }
    }

    pub(crate) fn entries(&self) -> u64 {
        self.entries
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn survivors(&self) -> &[Arc<Segment>] {
        &self.survivors
    }

    pub(crate) fn relocate(&mut self, ex: &Extracted) -> Result<(), OpCode> {
        for e in &ex.entries {
            let from = e.at();
            let raw = ex.source(from)?.raw_entry(from.offset)?;
            let v = EntryView::parse(&raw)?;
            let to = self.append(&raw, e.timestamp())?;

            // the copy is in place, only now may references move to it
            if self.policy.relocate(from, to, &v) {
                self.moved.push((from, to));
            } else if let Some(s) = self.survivors.last() {
                // died after extraction, the copy is garbage
                s.mark_dead(v.total_len());
            }
            self.entries += 1;
            self.bytes += v.total_len() as u64;
        }
        Ok(())
    }

    fn append(&mut self, raw: &[u8], timestamp: u32) -> Result<EntryRef, OpCode> {
        if let Some(s) = self.survivors.last() {
            match s.append_raw(raw) {
                Ok(off) => return Ok(EntryRef::new(s.handle(), off)),
                Err(OpCode::NoSpace) => self.dir.close_survivor(s),
                Err(e) => return Err(e),
            }
            if let Some(h) = self.replaces {
                log::error!("live data of {} doesn't fit in one survivor", h);
                return Err(OpCode::Invariant);
            }
        }

        let s = self.dir.alloc_survivor(self.replaces).inspect_err(|e| {
            log::warn!("can't allocate survivor, error {}", e);
        })?;
        if self.replaces.is_none() {
            // entries arrive oldest first
            s.set_created(timestamp);
        }
        self.survivors.push(s.clone());
        match s.append_raw(raw) {
            Ok(off) => Ok(EntryRef::new(s.handle(), off)),
            Err(OpCode::NoSpace) | Err(OpCode::TooLarge) => {
                log::error!("entry of {} bytes doesn't fit in an empty survivor", raw.len());
                Err(OpCode::Invariant)
            }
            Err(e) => Err(e),
        }
    }

    /// close the survivor still being filled
    pub(crate) fn finish(&mut self) -> Result<(), OpCode> {
        if let Some(s) = self.survivors.last() {
            if !s.is_closed() {
                self.dir.close_survivor(s);
            }
        }
        Ok(())
    }

    /// tombstones naming a segment this pass retired were copied while still live, account them
    /// as garbage now that the sources are gone
    pub(crate) fn release_dead_tombstones(&self) {
        let mut released = 0u64;
        for s in &self.survivors {
            let handle = s.handle();
            let res = s.walk(|off, v| {
                if v.kind == EntryKind::Tombstone
                    && !self.policy.is_live(EntryRef::new(handle, off), v)
                {
                    s.mark_dead(v.total_len());
                    released += v.total_len() as u64;
                }
            });
            if let Err(e) = res {
                log::error!("can't walk survivor {}, error {}", handle, e);
            }
        }
        if released > 0 {
            log::debug!("released {} bytes of dead tombstones", released);
        }
    }

    /// undo every reference move and drop the survivors, the sources are untouched
    pub(crate) fn rollback(&mut self, ex: &Extracted) {
        let moved = self.moved.len();
        while let Some((from, to)) = self.moved.pop() {
            let raw = match ex.source(from).and_then(|s| s.raw_entry(from.offset)) {
                Ok(raw) => raw,
                Err(e) => {
                    log::error!("can't reload {:?} for rollback, error {}", from, e);
                    continue;
                }
            };
            let Ok(v) = EntryView::parse(&raw) else {
                continue;
            };
            if !self.policy.relocate(to, from, &v) {
                log::debug!("{:?} was superseded while relocated", from);
            }
        }
        for s in self.survivors.drain(..) {
            self.dir.discard_survivor(&s);
        }
        log::warn!("rolled back {} relocated entries", moved);
    }
}

#[cfg(test)]
mod test {
    use super::Relocator;
    use crate::{
        cleaner::extract::live_sorted_entries,
        segment::EntryKind,
        store::{KeyIndex, SegmentDirectory},
        MemDirectory, OpCode,
    };
    use std::sync::Arc;

    fn setup(survivors: u32) -> (Arc<MemDirectory>, KeyIndex) {
        let dir = Arc::new(MemDirectory::new(1024, 256, 64, 32).unwrap());
        dir.reserve_survivors(survivors).unwrap();
        let idx = KeyIndex::new(dir.clone());
        (dir, idx)
    }

    fn fill(dir: &MemDirectory, idx: &KeyIndex, n: usize) {
        for i in 0..n {
            dir.advance_clock(1);
            idx.put(format!("key{i:04}").as_bytes(), &[i as u8; 40]).unwrap();
        }
        dir.roll_head();
    }

    #[test]
    fn spills_into_more_survivors() {
        let (dir, idx) = setup(4);
        fill(&dir, &idx, 40);
        let segs = dir.closed_segments();
        let ex = live_sorted_entries(&*dir, &idx, &segs).unwrap();

        let mut r = Relocator::new(&*dir, &idx, None);
        r.relocate(&ex).unwrap();
        r.finish().unwrap();
        assert_eq!(r.entries(), 40);
        assert_eq!(r.bytes(), ex.live_bytes);
        assert!(r.survivors().len() > 1);
        assert!(r.survivors().iter().all(|s| s.is_closed()));
        for i in 0..40 {
            let at = idx.lookup(format!("key{i:04}").as_bytes()).unwrap();
            assert!(r.survivors().iter().any(|s| s.handle() == at.segment));
        }
    }

    #[test]
    fn compaction_overflow_is_invariant() {
        let (dir, idx) = setup(4);
        fill(&dir, &idx, 40);
        let segs = dir.closed_segments();
        let ex = live_sorted_entries(&*dir, &idx, &segs).unwrap();

        let mut r = Relocator::new(&*dir, &idx, Some(segs[0].handle));
        assert_eq!(r.relocate(&ex), Err(OpCode::Invariant));
        r.rollback(&ex);
        for s in &segs {
            assert!(dir.segment(s.handle).is_ok());
        }
    }

    #[test]
    fn rollback_restores_references() {
        let (dir, idx) = setup(1);
        fill(&dir, &idx, 40);
        let before: Vec<_> = (0..40)
            .map(|i| idx.lookup(format!("key{i:04}").as_bytes()).unwrap())
            .collect();
        let segs = dir.closed_segments();
        let ex = live_sorted_entries(&*dir, &idx, &segs).unwrap();
        let reserved = dir.reserved_seglets();

        // a single reserved survivor can't hold all of it
        let mut r = Relocator::new(&*dir, &idx, None);
        assert_eq!(r.relocate(&ex), Err(OpCode::NoSpace));
        r.rollback(&ex);

        let after: Vec<_> = (0..40)
            .map(|i| idx.lookup(format!("key{i:04}").as_bytes()).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(dir.reserved_seglets(), reserved);
        assert!(r.survivors().is_empty());
    }

    #[test]
    fn dead_after_extraction_still_copied() {
        let (dir, idx) = setup(4);
        fill(&dir, &idx, 4);
        let segs = dir.closed_segments();
        let ex = live_sorted_entries(&*dir, &idx, &segs).unwrap();
        // deleted concurrently, after the live view was taken
        idx.del(b"key0000").unwrap();

        let mut r = Relocator::new(&*dir, &idx, None);
        r.relocate(&ex).unwrap();
        r.finish().unwrap();
        assert_eq!(r.entries(), 4);
        let s = &r.survivors()[0];
        let mut n = 0;
        s.walk(|_, v| {
            assert_eq!(v.kind, EntryKind::Object);
            n += 1;
        })
        .unwrap();
        assert_eq!(n, 4);
        assert_eq!(s.live_bytes(), ex.live_bytes / 4 * 3);
    }
}
