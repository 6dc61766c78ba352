pub use cleaner::{Cleaner, Context, Pass, State, Statistics};
pub use store::{
    EntryPolicy, KeyIndex, MemDirectory, MemReplicas, ReplicaManager, ReplicaStatus,
    SegmentDirectory,
};
pub use utils::{
    options::{Options, ParsedOptions},
    OpCode,
};

mod cleaner;
pub mod segment;
pub mod store;
mod utils;
