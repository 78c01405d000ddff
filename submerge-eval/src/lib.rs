#![allow(dead_code)]

mod pending;
mod point;
mod tree;
mod view;

pub use pending::{PendingWrite, RelevantWrite, WriteKind, WriteLog};
pub use point::SyncPoint;
pub use tree::SyncTree;
pub use view::{listener, Event, EventType, Listener, ListenerId, Operation, View};
