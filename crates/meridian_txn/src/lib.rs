pub mod engine;
pub mod lock;
pub mod read_only;
pub mod read_write;
mod reads;

#[cfg(test)]
mod tests;

pub use engine::{Engine, TxnStatsSnapshot};
pub use lock::{LockHandle, LockManager, LockPriority};
pub use read_only::{ReadOnlyTransaction, TimestampBound};
pub use read_write::{Mutation, ReadWriteTransaction, TxnState, WriteKind};
pub use reads::ReadArg;
