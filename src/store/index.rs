use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::sync::Arc;

use super::{EntryPolicy, SegmentDirectory};
use crate::{
    number_to_slice,
    segment::{EntryKind, EntryRef, EntryView, SegmentId},
    slice_to_number, MemDirectory, OpCode,
};

const KLEN: usize = size_of::<u16>();
const SEG_LEN: usize = size_of::<SegmentId>();

/// object payload: `| klen: u16 | key | value |`
fn encode_object(key: &[u8], val: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; KLEN];
    number_to_slice!(key.len() as u16, buf[..KLEN]);
    buf.extend_from_slice(key);
    buf.extend_from_slice(val);
    buf
}

fn decode_object(payload: &[u8]) -> Result<(&[u8], &[u8]), OpCode> {
    if payload.len() < KLEN {
        return Err(OpCode::BadData);
    }
    let klen = slice_to_number!(&payload[..KLEN], u16) as usize;
    let rest = &payload[KLEN..];
    if rest.len() < klen {
        return Err(OpCode::BadData);
    }
    Ok(rest.split_at(klen))
}

/// tombstone payload: `| segment id: u32 | klen: u16 | key |`, the segment id names where the
/// deleted object lived
fn encode_tombstone(id: SegmentId, key: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; SEG_LEN];
    number_to_slice!(id, buf[..SEG_LEN]);
    buf.extend_from_slice(&encode_object(key, &[]));
    buf
}

fn decode_tombstone(payload: &[u8]) -> Result<(SegmentId, &[u8]), OpCode> {
    if payload.len() < SEG_LEN {
        return Err(OpCode::BadData);
    }
    let id = slice_to_number!(&payload[..SEG_LEN], u32);
    let (key, _) = decode_object(&payload[SEG_LEN..])?;
    Ok((id, key))
}

/// a hash index from keys to the log entries holding their latest value
///
/// objects are live while the index points at them, tombstones are live while some version of
/// the segment that held the deleted object is stored, so compaction (which keeps segment ids)
/// can never reclaim them while disk cleaning can
pub struct KeyIndex {
    dir: Arc<MemDirectory>,
    map: DashMap<Vec<u8>, EntryRef>,
}

impl KeyIndex {
    pub fn new(dir: Arc<MemDirectory>) -> Self {
        Self {
            dir,
            map: DashMap::new(),
        }
    }

    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<EntryRef, OpCode> {
        if key.len() > u16::MAX as usize {
            return Err(OpCode::TooLarge);
        }
        let r = self.dir.append(EntryKind::Object, &encode_object(key, val))?;
        if let Some(old) = self.map.insert(key.to_vec(), r) {
            self.dir.mark_dead(old);
        }
        Ok(r)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, OpCode> {
        loop {
            let Some(r) = self.lookup(key) else {
                return Ok(None);
            };
            match self.dir.segment(r.segment).and_then(|s| s.entry(r.offset)) {
                Ok(e) => {
                    let (_, val) = decode_object(&e.payload)?;
                    return Ok(Some(val.to_vec()));
                }
                // moved by the cleaner and its old segment freed meanwhile
                Err(_) if self.lookup(key) != Some(r) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// remove the key and log a tombstone, return false if it didn't exist
    ///
    /// the key stays locked until the tombstone is logged, so the cleaner can't move the object
    /// away from the segment the tombstone names
    pub fn del(&self, key: &[u8]) -> Result<bool, OpCode> {
        let MapEntry::Occupied(o) = self.map.entry(key.to_vec()) else {
            return Ok(false);
        };
        let old = *o.get();
        self.dir
            .append(EntryKind::Tombstone, &encode_tombstone(old.segment.id, key))?;
        o.remove();
        self.dir.mark_dead(old);
        Ok(true)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<EntryRef> {
        self.map.get(key).map(|x| *x.value())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// key of an object or tombstone entry
    pub fn key_of<'a>(entry: &EntryView<'a>) -> Result<&'a [u8], OpCode> {
        match entry.kind {
            EntryKind::Object => decode_object(entry.payload).map(|(k, _)| k),
            EntryKind::Tombstone => decode_tombstone(entry.payload).map(|(_, k)| k),
        }
    }
}

impl EntryPolicy for KeyIndex {
    fn is_live(&self, at: EntryRef, entry: &EntryView<'_>) -> bool {
        match entry.kind {
            EntryKind::Object => match decode_object(entry.payload) {
                Ok((key, _)) => self.lookup(key) == Some(at),
                Err(e) => {
                    log::error!("bad object at {:?}, error {}", at, e);
                    false
                }
            },
            EntryKind::Tombstone => match decode_tombstone(entry.payload) {
                Ok((id, _)) => self.dir.contains_id(id),
                Err(e) => {
                    log::error!("bad tombstone at {:?}, error {}", at, e);
                    false
                }
            },
        }
    }

    fn relocate(&self, from: EntryRef, to: EntryRef, entry: &EntryView<'_>) -> bool {
        match entry.kind {
            // nothing refers to a tombstone
            EntryKind::Tombstone => true,
            EntryKind::Object => {
                let Ok((key, _)) = decode_object(entry.payload) else {
                    return false;
                };
                match self.map.entry(key.to_vec()) {
                    MapEntry::Occupied(mut o) if *o.get() == from => {
                        o.insert(to);
                        true
                    }
                    _ => false,
                }
            }
        }
    }
}
