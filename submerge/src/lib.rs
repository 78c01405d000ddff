// A Repo collects together all resources necessary to function as a replica
// of a client's view of a realtime database: the synchronized tree of local
// and server state, outstanding transactions, onDisconnect state, and the
// tag table correlating listens to server pushes.
//
// A Repo is driven by a single `Connection` and runs single-threaded and
// cooperatively scheduled; nothing here spawns a thread or blocks.

mod clock;
mod repo;

pub use clock::RepoClock;
pub use repo::Repo;

pub use submerge_eval::{listener, Event, EventType, Listener, ListenerId};
pub use submerge_lang::{Name, Path, QueryFilter, Scalar, Tsd};
pub use submerge_net::{ActionMsg, ConnError, Connection, ListenResult};
pub use submerge_txn::{Outcome, TransactionAbort, UpdateFn};
