// # Object Sync
//
// Sync store implementations and the tracker built on top of them.

pub mod file;
pub mod memory;
pub mod tracker;

pub use file::{FileSyncStore, FileSyncStoreFactory};
pub use memory::{MemorySyncStore, MemorySyncStoreFactory};
pub use tracker::{ObjectSyncTracker, ReplayReport, SyncAck, SyncMessage};
