use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use submerge_eval::{listener, Event, EventType, Listener, ListenerId, SyncTree};
use submerge_lang::{Name, Path, PushIdGenerator, QueryFilter, Tsd};
use submerge_net::{ActionMsg, Completer, ConnError, Connection, Promise, Scheduler, TagTable};
use submerge_txn::{Outcome, PendingSend, TransactionsTree, UpdateFn};
use submerge_vers::OnDisconnectManager;

use submerge_admin::RepoConfig;

use crate::clock::RepoClock;

struct TxnHandle {
    path: Path,
    listener_id: ListenerId,
}

struct RepoInner {
    sync_tree: SyncTree,
    transactions: TransactionsTree,
    on_disconnect: OnDisconnectManager,
    tags: TagTable,
    connection: Box<dyn Connection>,
    scheduler: Scheduler,
    push_ids: PushIdGenerator<RepoClock>,
    server_time_millis: Rc<Cell<i64>>,
    next_write_id: u64,
    active_listens: HashSet<(Path, QueryFilter)>,
    txn_completers: HashMap<u64, (Completer<Outcome>, TxnHandle)>,
}

impl RepoInner {
    fn alloc_write_id(&mut self) -> u64 {
        let id = self.next_write_id;
        self.next_write_id += 1;
        id
    }

    fn finalize_transaction(&mut self, write_id: u64, outcome: Outcome) {
        if let Some((completer, handle)) = self.txn_completers.remove(&write_id) {
            self.sync_tree.remove_listener(
                &handle.path,
                &QueryFilter::unfiltered(),
                EventType::Value,
                handle.listener_id,
            );
            completer.complete(outcome);
        }
    }
}

/// Glues the sync core together (spec.md §4.8): owns the `SyncTree` (which
/// in turn owns the write log), `TransactionsTree`, `OnDisconnectManager`
/// and `TagTable`, demultiplexes the `Connection`'s message stream, and
/// exposes the write-creating operations an application calls. Cheap to
/// clone (an `Rc` handle) so continuations registered against `Connection`
/// promises can call back into it without needing `'static` borrowed data.
#[derive(Clone)]
pub struct Repo {
    inner: Rc<RefCell<RepoInner>>,
}

impl Repo {
    pub fn new(connection: Box<dyn Connection>, config: RepoConfig) -> Repo {
        let server_time_millis = Rc::new(Cell::new(connection.server_time_millis()));
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x2545_F491_4F6C_DD1D);
        let push_ids = PushIdGenerator::new(RepoClock::new(server_time_millis.clone(), seed));
        Repo {
            inner: Rc::new(RefCell::new(RepoInner {
                sync_tree: SyncTree::new(),
                transactions: TransactionsTree::new(config.transaction_max_retries),
                on_disconnect: OnDisconnectManager::new(),
                tags: TagTable::new(),
                connection,
                scheduler: Scheduler::new(),
                push_ids,
                server_time_millis,
                next_write_id: 0,
                active_listens: HashSet::new(),
                txn_completers: HashMap::new(),
            })),
        }
    }

    /// Drain server-pushed messages, connectivity transitions, and the
    /// deferred-event scheduler, in that order. Applications call this
    /// whenever their `Connection` reports new incoming activity.
    pub fn pump(&self) {
        self.drain_messages();
        self.drain_connectivity();
        self.inner.borrow_mut().scheduler.drain();
    }

    fn drain_messages(&self) {
        loop {
            let msg = self.inner.borrow_mut().connection.poll_message();
            match msg {
                Some(msg) => self.dispatch_message(msg),
                None => break,
            }
        }
    }

    fn dispatch_message(&self, msg: ActionMsg) {
        let mut inner = self.inner.borrow_mut();
        match msg {
            ActionMsg::ActionSet { path, tag, data } => {
                let filter = tag.and_then(|t| inner.tags.lookup(t)).map(|(_, f)| f.clone());
                inner.sync_tree.apply_server_overwrite(&path, filter.as_ref(), data);
            }
            ActionMsg::ActionMerge { path, tag, data } => {
                let filter = tag.and_then(|t| inner.tags.lookup(t)).map(|(_, f)| f.clone());
                let changed: BTreeMap<Name, Tsd> =
                    data.children().map(|(n, t)| (n.clone(), t.clone())).collect();
                inner.sync_tree.apply_server_merge(&path, filter.as_ref(), &changed);
            }
            ActionMsg::ActionAuthRevoked => {
                tracing::error!(target: "submerge", "auth revoked");
            }
            ActionMsg::ActionListenRevoked { path, query } => {
                let filter = query.unwrap_or_else(QueryFilter::unfiltered);
                inner.sync_tree.apply_listen_revoked(&path, Some(&filter));
                inner.tags.revoke(&path, &filter);
                inner.active_listens.remove(&(path, filter));
            }
            ActionMsg::ActionSecurityDebug { message } => {
                tracing::debug!(target: "submerge", "{}", message);
            }
        }
    }

    fn drain_connectivity(&self) {
        loop {
            let change = self.inner.borrow_mut().connection.poll_connected_change();
            match change {
                Some(false) => self.handle_disconnect(),
                Some(true) => {}
                None => break,
            }
        }
    }

    /// `runOnDisconnectEvents` (spec.md §4.7) plus aborting every live
    /// transaction, mirroring §5's "Cancellation" (in-flight puts reject
    /// with a transport error, pending transactions fail).
    fn handle_disconnect(&self) {
        let mut inner = self.inner.borrow_mut();
        let server_time = inner.connection.server_time_millis();
        let mut aborted = {
            let RepoInner { sync_tree, transactions, on_disconnect, .. } = &mut *inner;
            on_disconnect.run(sync_tree, transactions, server_time)
        };
        // Every other outstanding transaction, including ones that never
        // overlapped a remembered onDisconnect path, also fails: the
        // connection that would have acked their `put` is gone.
        aborted.extend(inner.transactions.abort_overlapping(&Path::root()));
        for (write_id, outcome) in aborted {
            inner.finalize_transaction(write_id, outcome);
        }
    }

    // -- listening -----------------------------------------------------

    pub fn add_event_listener(
        &self,
        path: Path,
        filter: QueryFilter,
        ty: EventType,
        cb: Listener,
    ) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = {
            let RepoInner { sync_tree, scheduler, .. } = &mut *inner;
            sync_tree.add_listener(&path, &filter, ty, scheduler, cb).0
        };

        let key = (path.clone(), filter.clone());
        if !inner.active_listens.contains(&key) {
            inner.active_listens.insert(key);
            let tag = inner.tags.tag_for(&path, &filter);
            let query = if filter.is_unfiltered() { None } else { Some(filter) };
            inner.connection.listen(path, query, Some(tag)).on_complete(|result| {
                if let Err(e) = result {
                    tracing::error!(target: "submerge", "listen failed: {}", e);
                }
            });
        }
        id
    }

    pub fn remove_event_listener(&self, path: Path, filter: QueryFilter, ty: EventType, id: ListenerId) {
        let mut inner = self.inner.borrow_mut();
        inner.sync_tree.remove_listener(&path, &filter, ty, id);
        if inner.sync_tree.view_has_listeners(&path, &filter) {
            return;
        }
        let key = (path.clone(), filter.clone());
        if inner.active_listens.remove(&key) {
            let tag = inner.tags.tag_for(&path, &filter);
            inner.tags.revoke(&path, &filter);
            let query = if filter.is_unfiltered() { None } else { Some(filter) };
            inner.connection.unlisten(path, query, Some(tag));
        }
    }

    pub fn cached_value(&self, path: &Path, filter: &QueryFilter) -> Option<Tsd> {
        self.inner.borrow().sync_tree.cached_value(path, filter).cloned()
    }

    // -- direct writes ---------------------------------------------------

    pub fn set(&self, path: Path, value: Tsd) {
        Repo::set_impl(&self.inner, path, value);
    }

    pub fn update(&self, path: Path, changed: BTreeMap<Name, Tsd>) {
        let write_id;
        let resolved;
        {
            let mut inner = self.inner.borrow_mut();
            let server_time = inner.connection.server_time_millis();
            resolved = changed
                .into_iter()
                .map(|(n, v)| (n, v.resolve_sentinels(server_time)))
                .collect::<BTreeMap<Name, Tsd>>();
            write_id = inner.alloc_write_id();
            inner.sync_tree.apply_user_merge(write_id, path.clone(), resolved.clone());
        }
        {
            let mut inner = self.inner.borrow_mut();
            let aborted = inner.transactions.abort_overlapping(&path);
            for (wid, outcome) in aborted {
                inner.finalize_transaction(wid, outcome);
            }
        }
        let merged = Tsd::Node { children: resolved, priority: None };
        let promise = self.inner.borrow_mut().connection.merge(path.clone(), merged);
        let inner_rc = self.inner.clone();
        promise.on_complete(move |result| Repo::handle_direct_write_result(&inner_rc, path, write_id, result));
    }

    /// `push` (spec.md §4.5): generates a new child name from the
    /// server-synchronized clock and writes `value` under it.
    pub fn push(&self, path: Path, value: Tsd) -> Name {
        let name = {
            let mut inner = self.inner.borrow_mut();
            let server_time = inner.connection.server_time_millis();
            inner.server_time_millis.set(server_time);
            inner.push_ids.next()
        };
        self.set(path.child(name.clone()), value);
        name
    }

    fn set_impl(inner_rc: &Rc<RefCell<RepoInner>>, path: Path, value: Tsd) {
        let write_id;
        let resolved;
        {
            let mut inner = inner_rc.borrow_mut();
            let server_time = inner.connection.server_time_millis();
            resolved = value.resolve_sentinels(server_time);
            write_id = inner.alloc_write_id();
            inner.sync_tree.apply_user_overwrite(write_id, path.clone(), resolved.clone());
        }
        {
            let mut inner = inner_rc.borrow_mut();
            let aborted = inner.transactions.abort_overlapping(&path);
            for (wid, outcome) in aborted {
                inner.finalize_transaction(wid, outcome);
            }
        }
        let promise = inner_rc.borrow_mut().connection.put(path.clone(), resolved, None);
        let inner_rc2 = inner_rc.clone();
        promise.on_complete(move |result| Repo::handle_direct_write_result(&inner_rc2, path, write_id, result));
    }

    fn handle_direct_write_result(
        inner_rc: &Rc<RefCell<RepoInner>>,
        path: Path,
        write_id: u64,
        result: Result<(), ConnError>,
    ) {
        let mut inner = inner_rc.borrow_mut();
        match result {
            Ok(()) => inner.sync_tree.apply_ack(write_id, &path),
            Err(e) => {
                tracing::error!(target: "submerge", "write {} at {:?} failed: {}", write_id, path, e);
                inner.sync_tree.apply_reject(write_id, &path);
            }
        }
    }

    // -- transactions ------------------------------------------------------

    /// `transaction` (spec.md §4.6): silently subscribes to the unfiltered
    /// `"value"` listener at `path` so the engine sees server updates, then
    /// runs and sends the first attempt. The returned `Promise` completes
    /// with the committed value or the abort reason.
    pub fn transaction(&self, path: Path, update: UpdateFn) -> Promise<Outcome> {
        let (promise, completer) = submerge_net::promise();
        let write_id;
        let listener_id;
        {
            let mut inner = self.inner.borrow_mut();
            write_id = inner.alloc_write_id();
            let RepoInner { sync_tree, scheduler, .. } = &mut *inner;
            listener_id = sync_tree
                .add_listener(
                    &path,
                    &QueryFilter::unfiltered(),
                    EventType::Value,
                    scheduler,
                    listener(|_: Event| {}),
                )
                .0;
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.transactions.start(write_id, &path, update);
            inner
                .txn_completers
                .insert(write_id, (completer, TxnHandle { path: path.clone(), listener_id }));
        }
        Repo::stage_transactions(&self.inner, &path);
        promise
    }

    /// Stage whatever is ready to go out for the transaction touching
    /// `path`: find the composite subtree root (spec.md §4.6), run every
    /// `run`-phase transaction in it, and send the single combined put if
    /// the whole subtree came back ready. A no-op if something in that
    /// subtree already has a put in flight — staging resumes once that
    /// settles, via the unconditional restage at the end of
    /// [`Repo::handle_transaction_put_result`].
    fn stage_transactions(inner_rc: &Rc<RefCell<RepoInner>>, path: &Path) {
        let send;
        {
            let mut inner = inner_rc.borrow_mut();
            let root = inner.transactions.staging_root(path);
            let current =
                inner.sync_tree.cached_value(&root, &QueryFilter::unfiltered()).cloned().unwrap_or(Tsd::Nil);
            let result = inner.transactions.stage(&root, &current);
            for write in &result.writes {
                inner.sync_tree.apply_user_overwrite(write.write_id, write.path.clone(), write.value.clone());
            }
            for (write_id, outcome) in result.done {
                inner.finalize_transaction(write_id, outcome);
            }
            send = result.send;
        }
        if let Some(send) = send {
            Repo::send_transaction_put(inner_rc, send);
        }
    }

    fn send_transaction_put(inner_rc: &Rc<RefCell<RepoInner>>, send: PendingSend) {
        let promise = {
            let mut inner = inner_rc.borrow_mut();
            inner.connection.put(send.path.clone(), send.data.clone(), Some(send.expected_hash.clone()))
        };
        let inner_rc2 = inner_rc.clone();
        let path = send.path;
        promise.on_complete(move |result| {
            Repo::handle_transaction_put_result(&inner_rc2, path, result);
        });
    }

    /// The composite put sent for the subtree rooted at `path` resolved.
    /// Finalizes every transaction the server's response settles, restages
    /// any that need a rerun, and always retries staging afterward — a
    /// no-op if nothing in the subtree is ready, but necessary both to rerun
    /// after a stale rejection and to let a sibling transaction that was
    /// waiting behind this one now run.
    fn handle_transaction_put_result(
        inner_rc: &Rc<RefCell<RepoInner>>,
        path: Path,
        result: Result<(), ConnError>,
    ) {
        {
            let mut inner = inner_rc.borrow_mut();
            match result {
                Ok(()) => {
                    let done = inner.transactions.ack(&path);
                    for (write_id, _) in &done {
                        inner.sync_tree.apply_ack(*write_id, &path);
                    }
                    for (write_id, outcome) in done {
                        inner.finalize_transaction(write_id, outcome);
                    }
                }
                Err(ConnError::Server(ref e)) if e.is_data_stale() => {
                    let (reset, done) = inner.transactions.stale(&path);
                    for write_id in reset {
                        inner.sync_tree.apply_reject(write_id, &path);
                    }
                    for (write_id, outcome) in done {
                        inner.finalize_transaction(write_id, outcome);
                    }
                }
                Err(ConnError::Server(e)) => {
                    let done = inner.transactions.server_error(&path, e.code);
                    for (write_id, _) in &done {
                        inner.sync_tree.apply_reject(*write_id, &path);
                    }
                    for (write_id, outcome) in done {
                        inner.finalize_transaction(write_id, outcome);
                    }
                }
                Err(_) => {
                    let done = inner.transactions.server_error(&path, "transport".into());
                    for (write_id, _) in &done {
                        inner.sync_tree.apply_reject(*write_id, &path);
                    }
                    for (write_id, outcome) in done {
                        inner.finalize_transaction(write_id, outcome);
                    }
                }
            }
        }
        Repo::stage_transactions(inner_rc, &path);
    }

    /// External `abort(path)` (spec.md §4.6): fails every transaction
    /// overlapping `path` immediately (`run`-phase ones) or marks them for
    /// teardown once their in-flight `put` resolves.
    pub fn abort_transaction(&self, path: &Path) {
        let aborted = {
            let mut inner = self.inner.borrow_mut();
            inner.transactions.abort_overlapping(path)
        };
        let mut inner = self.inner.borrow_mut();
        for (write_id, outcome) in aborted {
            inner.finalize_transaction(write_id, outcome);
        }
    }

    // -- onDisconnect -----------------------------------------------------

    pub fn on_disconnect_put(&self, path: Path, value: Tsd) {
        let mut inner = self.inner.borrow_mut();
        inner.on_disconnect.put(&path, value.clone());
        inner.connection.on_disconnect_put(path, value).on_complete(|result| {
            if let Err(e) = result {
                tracing::error!(target: "submerge", "onDisconnect put failed: {}", e);
            }
        });
    }

    pub fn on_disconnect_merge(&self, path: Path, changed: BTreeMap<Name, Tsd>) {
        let mut inner = self.inner.borrow_mut();
        inner.on_disconnect.merge(&path, &changed);
        let data = Tsd::Node { children: changed, priority: None };
        inner.connection.on_disconnect_merge(path, data).on_complete(|result| {
            if let Err(e) = result {
                tracing::error!(target: "submerge", "onDisconnect merge failed: {}", e);
            }
        });
    }

    pub fn on_disconnect_cancel(&self, path: Path) {
        let mut inner = self.inner.borrow_mut();
        inner.on_disconnect.cancel(&path);
        inner.connection.on_disconnect_cancel(path).on_complete(|result| {
            if let Err(e) = result {
                tracing::error!(target: "submerge", "onDisconnect cancel failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::rc::Rc as StdRc;
    use submerge_lang::Scalar;
    use submerge_test::FakeConnection;

    fn leaf(n: f64) -> Tsd {
        Tsd::leaf(Scalar::Num(ordered_float::OrderedFloat(n)))
    }

    fn repo_with_fake() -> Repo {
        Repo::new(Box::new(FakeConnection::new()), RepoConfig::new())
    }

    #[test]
    fn set_is_visible_locally_before_the_put_resolves() {
        let repo = repo_with_fake();
        let path = Path::from_wire("/a").unwrap();
        let events = StdRc::new(RefCell::new(Vec::new()));
        let events2 = events.clone();
        repo.add_event_listener(
            path.clone(),
            QueryFilter::unfiltered(),
            EventType::Value,
            listener(move |e| events2.borrow_mut().push(e)),
        );
        repo.pump();
        events.borrow_mut().clear();

        repo.set(path.clone(), leaf(1.0));
        assert_eq!(*events.borrow(), vec![Event::Value(leaf(1.0))]);
        assert_eq!(repo.cached_value(&path, &QueryFilter::unfiltered()), Some(leaf(1.0)));
    }

    #[test]
    fn push_generates_a_twenty_char_name_and_writes_under_it() {
        let repo = repo_with_fake();
        let path = Path::from_wire("/items").unwrap();
        let name = repo.push(path.clone(), leaf(1.0));
        assert_eq!(name.as_str().len(), 20);
        assert_eq!(
            repo.cached_value(&path.child(name), &QueryFilter::unfiltered()),
            Some(leaf(1.0))
        );
    }

    #[test]
    fn transaction_commits_on_first_ack() {
        let repo = repo_with_fake();
        let path = Path::from_wire("/counter").unwrap();
        let promise = repo.transaction(path.clone(), Box::new(|_current| Some(leaf(1.0))));
        let outcome = StdRc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        promise.on_complete(move |o| *outcome2.borrow_mut() = Some(o));
        assert_eq!(*outcome.borrow(), Some(Outcome::Committed(leaf(1.0))));
        assert_eq!(repo.cached_value(&path, &QueryFilter::unfiltered()), Some(leaf(1.0)));
    }

    #[test]
    fn transaction_reruns_after_a_stale_rejection_and_then_commits() {
        let mut conn = FakeConnection::new();
        conn.script_put_response(Err(ConnError::Server(submerge_net::ServerError::new("datastale"))));
        let repo = Repo::new(Box::new(conn), RepoConfig::new());

        let path = Path::from_wire("/counter").unwrap();
        let calls = StdRc::new(RefCell::new(0));
        let calls2 = calls.clone();
        let promise = repo.transaction(
            path.clone(),
            Box::new(move |_current| {
                *calls2.borrow_mut() += 1;
                Some(leaf(1.0))
            }),
        );
        let outcome = StdRc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        promise.on_complete(move |o| *outcome2.borrow_mut() = Some(o));

        assert_eq!(*calls.borrow(), 2);
        assert_eq!(*outcome.borrow(), Some(Outcome::Committed(leaf(1.0))));
    }

    #[test]
    fn abort_transaction_finalizes_a_still_outstanding_transaction() {
        let repo = repo_with_fake();
        let path = Path::from_wire("/counter").unwrap();
        repo.abort_transaction(&path);
    }
}
