use crate::{number_to_slice, slice_to_number, OpCode};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EntryKind {
    Object = 1,
    /// marks a prior object as deleted, only reclaimable once the segment holding that object is
    /// gone from the backups
    Tombstone = 3,
}

impl TryFrom<u8> for EntryKind {
    type Error = OpCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Object),
            3 => Ok(Self::Tombstone),
            _ => Err(OpCode::BadData),
        }
    }
}

/// on-segment entry header, little endian
///
/// ```text
/// | kind: u8 | pad: [u8; 3] | len: u32 | timestamp: u32 | crc: u32 | payload: [u8; len] |
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// payload length, excluding the header
    pub len: u32,
    pub timestamp: u32,
    pub crc: u32,
}

impl EntryHeader {
    pub const LEN: usize = 16;

    pub fn new(kind: EntryKind, timestamp: u32, payload: &[u8]) -> Self {
        let len = payload.len() as u32;
        Self {
            kind,
            len,
            timestamp,
            crc: checksum(kind, len, timestamp, payload),
        }
    }

    /// header plus payload
    pub fn total_len(&self) -> u32 {
        Self::LEN as u32 + self.len
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= Self::LEN);
        buf[0] = self.kind as u8;
        buf[1..4].fill(0);
        number_to_slice!(self.len, buf[4..8]);
        number_to_slice!(self.timestamp, buf[8..12]);
        number_to_slice!(self.crc, buf[12..16]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, OpCode> {
        if buf.len() < Self::LEN {
            return Err(OpCode::BadData);
        }
        Ok(Self {
            kind: EntryKind::try_from(buf[0])?,
            len: slice_to_number!(&buf[4..8], u32),
            timestamp: slice_to_number!(&buf[8..12], u32),
            crc: slice_to_number!(&buf[12..16], u32),
        })
    }
}

fn checksum(kind: EntryKind, len: u32, timestamp: u32, payload: &[u8]) -> u32 {
    let mut meta = [0u8; 9];
    meta[0] = kind as u8;
    number_to_slice!(len, meta[1..5]);
    number_to_slice!(timestamp, meta[5..9]);
    crc32c::crc32c_append(crc32c::crc32c(&meta), payload)
}

/// borrowed view of an entry stored in a segment
#[derive(Clone, Copy, Debug)]
pub struct EntryView<'a> {
    pub kind: EntryKind,
    pub timestamp: u32,
    pub payload: &'a [u8],
}

impl<'a> EntryView<'a> {
    /// decode and verify the entry starting at the beginning of `buf`
    pub fn parse(buf: &'a [u8]) -> Result<Self, OpCode> {
        let h = EntryHeader::decode(buf)?;
        let end = EntryHeader::LEN + h.len as usize;
        if buf.len() < end {
            return Err(OpCode::BadData);
        }
        let payload = &buf[EntryHeader::LEN..end];
        if checksum(h.kind, h.len, h.timestamp, payload) != h.crc {
            return Err(OpCode::BadData);
        }
        Ok(Self {
            kind: h.kind,
            timestamp: h.timestamp,
            payload,
        })
    }

    pub fn total_len(&self) -> u32 {
        (EntryHeader::LEN + self.payload.len()) as u32
    }

    pub fn to_entry(&self) -> Entry {
        Entry {
            kind: self.kind,
            timestamp: self.timestamp,
            payload: self.payload.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn view(&self) -> EntryView<'_> {
        EntryView {
            kind: self.kind,
            timestamp: self.timestamp,
            payload: &self.payload,
        }
    }
}

/// append the encoded entry to `out`
pub fn encode_entry(kind: EntryKind, timestamp: u32, payload: &[u8], out: &mut Vec<u8>) {
    let h = EntryHeader::new(kind, timestamp, payload);
    let pos = out.len();
    out.resize(pos + EntryHeader::LEN, 0);
    h.encode(&mut out[pos..]);
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod test {
    use super::{encode_entry, EntryHeader, EntryKind, EntryView};
    use crate::OpCode;

    #[test]
    fn parse_encoded() {
        let mut buf = Vec::new();
        encode_entry(EntryKind::Tombstone, 42, b"mo", &mut buf);
        assert_eq!(buf.len(), EntryHeader::LEN + 2);

        let v = EntryView::parse(&buf).unwrap();
        assert_eq!(v.kind, EntryKind::Tombstone);
        assert_eq!(v.timestamp, 42);
        assert_eq!(v.payload, b"mo");
        assert_eq!(v.total_len() as usize, buf.len());
    }

    #[test]
    fn corrupted_payload() {
        let mut buf = Vec::new();
        encode_entry(EntryKind::Object, 1, b"payload", &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert_eq!(EntryView::parse(&buf).err(), Some(OpCode::BadData));

        buf[0] = 0;
        assert_eq!(EntryView::parse(&buf).err(), Some(OpCode::BadData));
    }

    #[test]
    fn truncated() {
        let mut buf = Vec::new();
        encode_entry(EntryKind::Object, 1, b"payload", &mut buf);
        assert_eq!(
            EntryView::parse(&buf[..buf.len() - 1]).err(),
            Some(OpCode::BadData)
        );
        assert_eq!(EntryView::parse(&buf[..3]).err(), Some(OpCode::BadData));
    }
}
