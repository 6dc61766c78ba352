pub(crate) mod countblock;
pub(crate) mod failpoint;
pub(crate) mod options;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// no survivor segment or seglet could be allocated
    NoSpace,
    /// a survivor segment was not durably replicated
    ReplicaFailed,
    /// cleaning would break space accounting, the pass is aborted
    Invariant,
    BadData,
    TooLarge,
    /// handle refers to a segment that was freed or compacted
    Stale,
    Invalid,
    Again,
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}", self))
    }
}

impl std::error::Error for OpCode {}

#[macro_export]
macro_rules! static_assert {
    ($cond:expr, $msg:expr) => {
        const _: () = assert!($cond, $msg);
    };

    ($cond:expr) => {
        const _: () = assert!($cond);
    };
}

#[macro_export]
macro_rules! number_to_slice {
    ($num: expr, $slice:expr) => {
        $slice.copy_from_slice(&$num.to_le_bytes());
    };
}

#[macro_export]
macro_rules! slice_to_number {
    ($slice:expr, $num:ty) => {{
        let mut tmp = [0u8; size_of::<$num>()];
        tmp.copy_from_slice($slice);
        <$num>::from_le_bytes(tmp)
    }};
}

pub(crate) const ID_BITS: u64 = 32;

pub(crate) const fn pack_id(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << ID_BITS) | lo as u64
}

pub(crate) const fn unpack_id(x: u64) -> (u32, u32) {
    ((x >> ID_BITS) as u32, (x & ((1u64 << ID_BITS) - 1)) as u32)
}

/// integer percentage, `part` over `whole`, 0 when `whole` is 0
pub(crate) const fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        0
    } else {
        (part.saturating_mul(100) / whole) as u32
    }
}

#[cfg(test)]
mod test {
    use super::{pack_id, percent, unpack_id};

    #[test]
    fn pack_unpack() {
        let x = pack_id(7, 3);
        assert_eq!(unpack_id(x), (7, 3));
        assert_eq!(unpack_id(pack_id(u32::MAX, 0)), (u32::MAX, 0));
    }

    #[test]
    fn percent_of_zero() {
        assert_eq!(percent(10, 0), 0);
        assert_eq!(percent(98, 100), 98);
        assert_eq!(percent(1, 3), 33);
    }
}
