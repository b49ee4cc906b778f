//! Client side of Canvas Sync.
//!
//! A [`SyncAdapter`] wraps an [`EditorSurface`], keeps it connected to the
//! relay, replays remote mutations into it, and forwards local edits.

pub mod adapter;
pub mod store;
pub mod surface;

pub use adapter::SyncAdapter;
pub use store::{DirectorySnapshotStore, SnapshotStore, StoredSnapshot};
pub use surface::{ChangeKind, EditorSurface, LocalEditObserver, MemorySurface, NodeOperation};
