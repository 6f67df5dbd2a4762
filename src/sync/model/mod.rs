mod address;
mod constraint;
pub mod field_path;
mod snapshot;
mod target;
mod write;

pub use address::{Address, IntoAddress};
pub use constraint::{Constraint, CursorEdge, Direction, RangeOp};
pub use snapshot::{DocumentData, Snapshot, SnapshotMetadata, Version};
pub use target::WatchTarget;
pub use write::{SequencedWrite, WriteOp};
