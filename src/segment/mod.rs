use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::{
    utils::{pack_id, percent, unpack_id},
    OpCode,
};

pub(crate) mod entry;

pub use entry::{encode_entry, Entry, EntryHeader, EntryKind, EntryView};

pub type SegmentId = u32;
pub type SegletId = u32;

/// arena style handle of a segment owned by the segment directory, the generation is bumped
/// whenever a segment is compacted so that handles taken before the compaction are detected as
/// stale
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SegmentHandle {
    pub id: SegmentId,
    pub generation: u32,
}

impl SegmentHandle {
    pub const fn new(id: SegmentId, generation: u32) -> Self {
        Self { id, generation }
    }

    pub const fn pack(&self) -> u64 {
        pack_id(self.id, self.generation)
    }

    pub const fn unpack(x: u64) -> Self {
        let (id, generation) = unpack_id(x);
        Self { id, generation }
    }

    /// handle of the compacted replacement, which keeps the id
    pub const fn next_generation(&self) -> Self {
        Self::new(self.id, self.generation.wrapping_add(1))
    }
}

impl std::fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.generation)
    }
}

/// location of a single log entry, it's not an owning handle and it's only valid while the
/// segment is
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EntryRef {
    pub segment: SegmentHandle,
    pub offset: u32,
}

impl EntryRef {
    pub const fn new(segment: SegmentHandle, offset: u32) -> Self {
        Self { segment, offset }
    }
}

/// an append-only container built from fixed size seglets, immutable once closed
pub struct Segment {
    handle: SegmentHandle,
    seglet_size: u32,
    created: AtomicU32,
    seglets: Mutex<Vec<SegletId>>,
    data: RwLock<Vec<u8>>,
    live_bytes: AtomicU64,
    closed: AtomicBool,
}

impl Segment {
    pub fn new(handle: SegmentHandle, created: u32, seglet_size: u32, seglets: Vec<SegletId>) -> Self {
        let cap = seglets.len() * seglet_size as usize;
        Self {
            handle,
            seglet_size,
            created: AtomicU32::new(created),
            seglets: Mutex::new(seglets),
            data: RwLock::new(Vec::with_capacity(cap)),
            live_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> SegmentHandle {
        self.handle
    }

    pub fn id(&self) -> SegmentId {
        self.handle.id
    }

    pub fn created(&self) -> u32 {
        self.created.load(Relaxed)
    }

    pub(crate) fn set_created(&self, ts: u32) {
        self.created.store(ts, Relaxed);
    }

    pub fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    pub fn seglet_count(&self) -> u32 {
        self.seglets.lock().len() as u32
    }

    pub fn seglets(&self) -> Vec<SegletId> {
        self.seglets.lock().clone()
    }

    /// bytes of the seglets currently allocated to this segment
    pub fn capacity(&self) -> u32 {
        self.seglet_count() * self.seglet_size
    }

    /// bytes appended so far
    pub fn tail(&self) -> u32 {
        self.data.read().len() as u32
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Relaxed)
    }

    /// the entry of `len` bytes (header included) is no longer referenced
    pub fn mark_dead(&self, len: u32) {
        let _ = self
            .live_bytes
            .fetch_update(Relaxed, Relaxed, |x| Some(x.saturating_sub(len as u64)));
    }

    pub fn memory_utilization(&self) -> u32 {
        percent(self.live_bytes(), self.capacity() as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Release);
    }

    pub fn is_empty(&self) -> bool {
        self.tail() == 0
    }

    /// encode and append an entry, return its offset
    pub fn append(&self, kind: EntryKind, timestamp: u32, payload: &[u8]) -> Result<u32, OpCode> {
        let total = EntryHeader::LEN + payload.len();
        let mut data = self.data.write();
        self.check_room(&data, total)?;
        let off = data.len() as u32;
        encode_entry(kind, timestamp, payload, &mut data);
        self.live_bytes.fetch_add(total as u64, Relaxed);
        Ok(off)
    }

    /// append an already encoded entry, it's verified before being copied
    pub fn append_raw(&self, raw: &[u8]) -> Result<u32, OpCode> {
        let v = EntryView::parse(raw)?;
        let total = v.total_len() as usize;
        let mut data = self.data.write();
        self.check_room(&data, total)?;
        let off = data.len() as u32;
        data.extend_from_slice(&raw[..total]);
        self.live_bytes.fetch_add(total as u64, Relaxed);
        Ok(off)
    }

    fn check_room(&self, data: &[u8], total: usize) -> Result<(), OpCode> {
        if self.is_closed() {
            log::error!("append to closed segment {}", self.handle);
            return Err(OpCode::Invalid);
        }
        let cap = self.capacity() as usize;
        if total > cap {
            return Err(OpCode::TooLarge);
        }
        if data.len() + total > cap {
            return Err(OpCode::NoSpace);
        }
        Ok(())
    }

    pub fn entry(&self, offset: u32) -> Result<Entry, OpCode> {
        let data = self.data.read();
        let buf = data.get(offset as usize..).ok_or(OpCode::BadData)?;
        Ok(EntryView::parse(buf)?.to_entry())
    }

    /// copy of the encoded entry at `offset`, header included
    pub fn raw_entry(&self, offset: u32) -> Result<Vec<u8>, OpCode> {
        let data = self.data.read();
        let buf = data.get(offset as usize..).ok_or(OpCode::BadData)?;
        let v = EntryView::parse(buf)?;
        Ok(buf[..v.total_len() as usize].to_vec())
    }

    /// total length of the entry at `offset`
    pub fn entry_len(&self, offset: u32) -> Result<u32, OpCode> {
        let data = self.data.read();
        let buf = data.get(offset as usize..).ok_or(OpCode::BadData)?;
        Ok(EntryHeader::decode(buf)?.total_len())
    }

    /// walk all entries in append order, stop at the first corrupted one
    pub fn walk<F>(&self, mut f: F) -> Result<(), OpCode>
    where
        F: FnMut(u32, &EntryView<'_>),
    {
        let data = self.data.read();
        let mut pos = 0usize;
        while pos < data.len() {
            let v = EntryView::parse(&data[pos..]).inspect_err(|e| {
                log::error!("segment {} corrupted at {}: {}", self.handle, pos, e);
            })?;
            f(pos as u32, &v);
            pos += v.total_len() as usize;
        }
        Ok(())
    }

    /// release the trailing seglets a closed segment doesn't use, return them
    pub(crate) fn shrink(&self) -> Vec<SegletId> {
        debug_assert!(self.is_closed());
        let tail = self.tail();
        let keep = tail.div_ceil(self.seglet_size) as usize;
        let mut seglets = self.seglets.lock();
        if keep >= seglets.len() {
            return Vec::new();
        }
        seglets.split_off(keep)
    }

    /// release all seglets
    pub(crate) fn take_seglets(&self) -> Vec<SegletId> {
        std::mem::take(&mut *self.seglets.lock())
    }

    pub fn info(&self, segment_size: u32) -> SegmentInfo {
        SegmentInfo {
            handle: self.handle,
            created: self.created(),
            live_bytes: self.live_bytes(),
            seglets: self.seglet_count(),
            seglet_size: self.seglet_size,
            segment_size,
        }
    }
}

/// metadata snapshot of a closed segment, taken when the candidate set is rebuilt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub handle: SegmentHandle,
    pub created: u32,
    pub live_bytes: u64,
    pub seglets: u32,
    pub seglet_size: u32,
    /// size of a full segment
    pub segment_size: u32,
}

impl SegmentInfo {
    pub fn allocated_bytes(&self) -> u64 {
        self.seglets as u64 * self.seglet_size as u64
    }

    /// live bytes over the seglets it occupies in memory
    pub fn memory_utilization(&self) -> u32 {
        percent(self.live_bytes, self.allocated_bytes())
    }

    /// live bytes over a full segment, which is what the backups store
    pub fn disk_utilization(&self) -> u32 {
        percent(self.live_bytes, self.segment_size as u64)
    }

    /// seglets released if the live data were packed into a fresh segment
    pub fn freeable_seglets(&self) -> u32 {
        let need = self.live_bytes.div_ceil(self.seglet_size as u64);
        (self.seglets as u64).saturating_sub(need) as u32
    }
}

#[cfg(test)]
mod test {
    use super::{EntryKind, Segment, SegmentHandle, SegmentInfo};
    use crate::OpCode;

    fn segment(seglets: u32) -> Segment {
        Segment::new(SegmentHandle::new(1, 0), 0, 64, (0..seglets).collect())
    }

    #[test]
    fn append_until_full() {
        let s = segment(2);
        let payload = [7u8; 48]; // 64 bytes with header
        assert_eq!(s.append(EntryKind::Object, 1, &payload), Ok(0));
        assert_eq!(s.append(EntryKind::Object, 2, &payload), Ok(64));
        assert_eq!(
            s.append(EntryKind::Object, 3, &payload),
            Err(OpCode::NoSpace)
        );
        assert_eq!(
            s.append(EntryKind::Object, 3, &[0u8; 200]),
            Err(OpCode::TooLarge)
        );
        assert_eq!(s.live_bytes(), 128);
        assert_eq!(s.memory_utilization(), 100);

        let mut seen = Vec::new();
        s.walk(|off, v| seen.push((off, v.timestamp))).unwrap();
        assert_eq!(seen, vec![(0, 1), (64, 2)]);
    }

    #[test]
    fn closed_rejects_append() {
        let s = segment(1);
        s.close();
        assert_eq!(
            s.append(EntryKind::Object, 1, b"x"),
            Err(OpCode::Invalid)
        );
    }

    #[test]
    fn shrink_releases_tail_seglets() {
        let s = segment(4);
        s.append(EntryKind::Object, 1, &[1u8; 60]).unwrap(); // 76 bytes, 2 seglets
        s.close();
        assert_eq!(s.shrink(), vec![2, 3]);
        assert_eq!(s.seglet_count(), 2);
        assert!(s.shrink().is_empty());
    }

    #[test]
    fn raw_copy_keeps_content() {
        let a = segment(2);
        let b = Segment::new(SegmentHandle::new(2, 0), 0, 64, vec![9]);
        let off = a.append(EntryKind::Tombstone, 5, b"gone").unwrap();
        let raw = a.raw_entry(off).unwrap();
        let to = b.append_raw(&raw).unwrap();
        assert_eq!(a.entry(off).unwrap(), b.entry(to).unwrap());
        assert_eq!(b.entry_len(to), Ok(20));
    }

    #[test]
    fn info_utilization() {
        let info = SegmentInfo {
            handle: SegmentHandle::new(3, 1),
            created: 0,
            live_bytes: 100,
            seglets: 4,
            seglet_size: 64,
            segment_size: 512,
        };
        assert_eq!(info.memory_utilization(), 39);
        assert_eq!(info.disk_utilization(), 19);
        assert_eq!(info.freeable_seglets(), 2);
        assert_eq!(SegmentHandle::unpack(info.handle.pack()), info.handle);
    }
}
