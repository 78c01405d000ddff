use std::fmt;

use serde::{Deserialize, Serialize};
use submerge_lang::{Path, QueryFilter, Tsd};

use crate::sched::Promise;

/// `{ code: string }` from the server (spec.md §6). `"datastale"` is
/// significant to the transaction engine; every other code is fatal to the
/// in-flight transaction(s) or write.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>) -> ServerError {
        ServerError { code: code.into() }
    }

    pub fn is_data_stale(&self) -> bool {
        self.code.eq_ignore_ascii_case("datastale")
    }
}

/// The failure modes a Connection call can surface (spec.md §7).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnError {
    Transport,
    Server(ServerError),
    ListenRevoked,
    AuthRevoked,
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Transport => write!(f, "transport error"),
            ConnError::Server(e) => write!(f, "server error: {}", e.code),
            ConnError::ListenRevoked => write!(f, "listen revoked"),
            ConnError::AuthRevoked => write!(f, "auth revoked"),
        }
    }
}
impl std::error::Error for ConnError {}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthData {
    pub uid: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListenResult {
    pub warnings: Vec<String>,
}

/// Server-pushed messages (spec.md §6). `tag` correlates an `actionSet`/
/// `actionMerge` back to the listen that requested it, via the tag table;
/// `None` means the unfiltered/default listen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActionMsg {
    ActionSet { path: Path, tag: Option<i64>, data: Tsd },
    ActionMerge { path: Path, tag: Option<i64>, data: Tsd },
    ActionAuthRevoked,
    ActionListenRevoked { path: Path, query: Option<QueryFilter> },
    ActionSecurityDebug { message: String },
}

/// The duplex channel the sync core consumes (spec.md §6). Every call
/// suspends at most once, at the point the implementation hands work to the
/// transport; completion is delivered through the returned [`Promise`]
/// rather than by blocking.
pub trait Connection {
    fn auth(&mut self, token: String) -> Promise<Result<AuthData, ConnError>>;
    fn unauth(&mut self) -> Promise<Result<(), ConnError>>;

    fn put(
        &mut self,
        path: Path,
        data: Tsd,
        expected_hash: Option<String>,
    ) -> Promise<Result<(), ConnError>>;
    fn merge(&mut self, path: Path, data: Tsd) -> Promise<Result<(), ConnError>>;

    fn listen(
        &mut self,
        path: Path,
        query: Option<QueryFilter>,
        tag: Option<i64>,
    ) -> Promise<Result<ListenResult, ConnError>>;
    fn unlisten(&mut self, path: Path, query: Option<QueryFilter>, tag: Option<i64>);

    fn on_disconnect_put(&mut self, path: Path, data: Tsd) -> Promise<Result<(), ConnError>>;
    fn on_disconnect_merge(&mut self, path: Path, data: Tsd) -> Promise<Result<(), ConnError>>;
    fn on_disconnect_cancel(&mut self, path: Path) -> Promise<Result<(), ConnError>>;

    /// Server-synchronized wall clock, milliseconds since epoch.
    fn server_time_millis(&self) -> i64;

    /// Drain at most one pending server-pushed message.
    fn poll_message(&mut self) -> Option<ActionMsg>;
    /// Drain at most one pending connectivity transition (`true` = connected).
    fn poll_connected_change(&mut self) -> Option<bool>;
}
