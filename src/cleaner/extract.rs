use std::{collections::HashMap, sync::Arc};

use crate::{
    segment::{EntryRef, Segment, SegmentHandle, SegmentInfo},
    static_assert,
    store::{EntryPolicy, SegmentDirectory},
    OpCode,
};

/// a live entry being cleaned together with a cache of its timestamp, so sorting by age doesn't
/// have to parse the entry on every comparison
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct LiveEntry {
    /// packed [`SegmentHandle`]
    segment: u64,
    offset: u32,
    timestamp: u32,
}

static_assert!(size_of::<LiveEntry>() == 16, "LiveEntry isn't the expected size");

impl LiveEntry {
    pub(crate) fn new(at: EntryRef, timestamp: u32) -> Self {
        Self {
            segment: at.segment.pack(),
            offset: at.offset,
            timestamp,
        }
    }

    pub(crate) fn at(&self) -> EntryRef {
        EntryRef::new(SegmentHandle::unpack(self.segment), self.offset)
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

/// the segments of one pass and what is still live in them, the view is taken once and not
/// refreshed while relocating
pub(crate) struct Extracted {
    pub(crate) sources: HashMap<u64, Arc<Segment>>,
    pub(crate) entries: Vec<LiveEntry>,
    pub(crate) live_bytes: u64,
}

impl Extracted {
    pub(crate) fn source(&self, at: EntryRef) -> Result<&Arc<Segment>, OpCode> {
        self.sources.get(&at.segment.pack()).ok_or_else(|| {
            log::error!("entry {:?} doesn't belong to the pass", at);
            OpCode::Invariant
        })
    }

    pub(crate) fn handles(&self) -> Vec<SegmentHandle> {
        let mut v: Vec<SegmentHandle> = self
            .sources
            .keys()
            .map(|x| SegmentHandle::unpack(*x))
            .collect();
        v.sort_unstable();
        v
    }

    /// survivors and seglets the entries take when copied in order into segments of
    /// `segment_size`, each survivor shrunk to the seglets it uses
    pub(crate) fn packed(
        &self,
        segment_size: u32,
        seglet_size: u32,
    ) -> Result<(usize, u64), OpCode> {
        let seglet = seglet_size as u64;
        let mut survivors = 0;
        let mut seglets = 0;
        let mut used = 0u64;
        for e in &self.entries {
            let at = e.at();
            let len = self.source(at)?.entry_len(at.offset)? as u64;
            if survivors == 0 || used + len > segment_size as u64 {
                seglets += used.div_ceil(seglet);
                survivors += 1;
                used = 0;
            }
            used += len;
        }
        Ok((survivors, seglets + used.div_ceil(seglet)))
    }
}

/// collect the live entries of `segs` and sort them by age, oldest first
pub(crate) fn live_sorted_entries(
    dir: &dyn SegmentDirectory,
    policy: &dyn EntryPolicy,
    segs: &[SegmentInfo],
) -> Result<Extracted, OpCode> {
    let mut out = Extracted {
        sources: HashMap::with_capacity(segs.len()),
        entries: Vec::new(),
        live_bytes: 0,
    };

    for info in segs {
        let seg = dir.segment(info.handle).inspect_err(|e| {
            log::warn!("candidate {} vanished, error {}", info.handle, e);
        })?;
        let handle = seg.handle();
        seg.walk(|off, v| {
            let at = EntryRef::new(handle, off);
            if policy.is_live(at, v) {
                out.entries.push(LiveEntry::new(at, v.timestamp));
                out.live_bytes += v.total_len() as u64;
            }
        })?;
        out.sources.insert(handle.pack(), seg);
    }

    sort_by_age(&mut out.entries);
    Ok(out)
}

/// ascending timestamp, the order among equal timestamps carries no meaning
pub(crate) fn sort_by_age(entries: &mut [LiveEntry]) {
    entries.sort_by_key(|x| x.timestamp);
}
