//! Collaborator traits
//!
//! The abstract interfaces the core consumes:
//!
//! - [`Transport`]: Move bytes to devices and edge targets
//! - [`SyncStore`]: Persist per-object sync versions
//! - [`ObjectSource`]: List the live objects of an edge target

pub mod object_source;
pub mod sync_store;
pub mod transport;

pub use object_source::{LiveObject, ObjectSource};
pub use sync_store::{ApplyOutcome, ObjectKey, ObjectScope, SyncRecord, SyncStore, SyncStoreFactory};
pub use transport::{InboundReport, InboundStream, Transport};
