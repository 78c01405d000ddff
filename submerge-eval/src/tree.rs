use std::collections::BTreeMap;

use submerge_lang::{Name, Path, QueryFilter, Tsd};
use submerge_net::Scheduler;

use crate::pending::{PendingWrite, WriteKind, WriteLog};
use crate::point::SyncPoint;
use crate::view::{EventType, Listener, ListenerId, Operation, View};

#[derive(Default)]
struct SyncTreeNode {
    sync_point: SyncPoint,
    children: BTreeMap<Name, SyncTreeNode>,
}

/// Routes server pushes and user writes to the [`SyncPoint`]s they affect,
/// keeping each one's local value up to date (spec.md §4.3). Owns the
/// [`WriteLog`] that every [`View`] consults to fold its pending writes.
#[derive(Default)]
pub struct SyncTree {
    root: SyncTreeNode,
    write_log: WriteLog,
}

impl SyncTree {
    pub fn new() -> SyncTree {
        SyncTree::default()
    }

    fn node_mut(&mut self, path: &Path) -> &mut SyncTreeNode {
        let mut node = &mut self.root;
        for name in path.parts() {
            node = node.children.entry(name.clone()).or_default();
        }
        node
    }

    fn node(&self, path: &Path) -> Option<&SyncTreeNode> {
        let mut node = &self.root;
        for name in path.parts() {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    /// Look up the rendered local value for one registered query, or `None`
    /// if that query has no view at `path`. Per the resolved open question,
    /// this performs a read-only lookup: it never synthesizes or caches a
    /// value for a query nobody has listened to (spec.md §9).
    pub fn cached_value(&self, path: &Path, filter: &QueryFilter) -> Option<&Tsd> {
        self.node(path)?.sync_point.view(filter).map(View::local_version)
    }

    /// Whether any listener, of any event type, is still registered for
    /// this `(path, filter)` view. The `Repo` coordinator uses this to
    /// decide whether a server-side `unlisten` is due after a removal.
    pub fn view_has_listeners(&self, path: &Path, filter: &QueryFilter) -> bool {
        self.node(path)
            .and_then(|n| n.sync_point.view(filter))
            .map(View::has_listeners)
            .unwrap_or(false)
    }

    // -- server-pushed state ------------------------------------------------

    /// `actionSet` (spec.md §6): the server asserts the full subtree at
    /// `path`. `filter` is `None` for the default, unfiltered listen and
    /// `Some` for a specific query's tag.
    pub fn apply_server_overwrite(&mut self, path: &Path, filter: Option<&QueryFilter>, tsd: Tsd) {
        self.apply_server_operation_at(path, filter, Operation::Overwrite(tsd.clone()));
        self.propagate_overwrite_to_descendants(path, &tsd);
        self.refresh_subtree(path);
    }

    /// `actionMerge` (spec.md §6): the server asserts new values for some of
    /// `path`'s immediate children.
    pub fn apply_server_merge(
        &mut self,
        path: &Path,
        filter: Option<&QueryFilter>,
        changed_children: &BTreeMap<Name, Tsd>,
    ) {
        self.apply_server_operation_at(path, filter, Operation::Merge(changed_children.clone()));
        for (name, child_tsd) in changed_children {
            let child_path = path.child(name.clone());
            self.apply_server_operation_at(&child_path, None, Operation::Overwrite(child_tsd.clone()));
            self.propagate_overwrite_to_descendants(&child_path, child_tsd);
        }
        self.refresh_subtree(path);
    }

    fn apply_server_operation_at(&mut self, path: &Path, filter: Option<&QueryFilter>, op: Operation) {
        let node = self.node_mut(path);
        match filter {
            Some(f) => {
                node.sync_point.view_mut(f).apply_server_operation(op);
            }
            None => {
                for view in node.sync_point.views_mut() {
                    view.apply_server_operation(op.clone());
                }
            }
        }
    }

    /// A full overwrite at `path` also determines the value of every
    /// descendant SyncPoint's subtree, so their `server_version` needs
    /// refreshing too (spec.md §4.3).
    fn propagate_overwrite_to_descendants(&mut self, path: &Path, tsd: &Tsd) {
        let Some(node) = self.node_mut_if_present(path) else { return };
        Self::propagate_into(node, tsd);
    }

    fn node_mut_if_present(&mut self, path: &Path) -> Option<&mut SyncTreeNode> {
        let mut node = &mut self.root;
        for name in path.parts() {
            node = node.children.get_mut(name)?;
        }
        Some(node)
    }

    fn propagate_into(node: &mut SyncTreeNode, tsd: &Tsd) {
        for (name, child_node) in node.children.iter_mut() {
            let child_tsd = tsd.child(name);
            for view in child_node.sync_point.views_mut() {
                view.apply_server_operation(Operation::Overwrite(child_tsd.clone()));
            }
            Self::propagate_into(child_node, &child_tsd);
        }
    }

    // -- user writes ----------------------------------------------------

    pub fn apply_user_overwrite(&mut self, write_id: u64, path: Path, tsd: Tsd) {
        self.write_log.push(PendingWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Overwrite(tsd),
            apply_locally: true,
        });
        self.refresh_everything_touching(&path);
    }

    pub fn apply_user_merge(&mut self, write_id: u64, path: Path, changed: BTreeMap<Name, Tsd>) {
        self.write_log.push(PendingWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Merge(changed),
            apply_locally: true,
        });
        self.refresh_everything_touching(&path);
    }

    /// Acknowledge success: the write is dropped from the log once the
    /// server has accepted it. The optimistic value it contributed remains
    /// visible, layered in via any later server echo.
    pub fn apply_ack(&mut self, write_id: u64, path: &Path) {
        if self.write_log.remove(write_id).is_some() {
            self.refresh_everything_touching(path);
        }
    }

    /// Reject: identical bookkeeping to an ack, the caller is responsible
    /// for surfacing the error to whoever issued the write.
    pub fn apply_reject(&mut self, write_id: u64, path: &Path) {
        self.apply_ack(write_id, path);
    }

    /// `actionListenRevoked` (spec.md §6): fire `cancel` to the view's
    /// listeners and drop it; there is nothing left to keep synced.
    pub fn apply_listen_revoked(&mut self, path: &Path, filter: Option<&QueryFilter>) {
        let Some(node) = self.node_mut_if_present(path) else { return };
        match filter {
            Some(f) => {
                if let Some(mut view) = node.sync_point.remove_view(f) {
                    view.emit_cancel();
                }
            }
            None => {
                let filters: Vec<QueryFilter> = node.sync_point.views().map(|v| v.filter().clone()).collect();
                for f in filters {
                    if let Some(mut view) = node.sync_point.remove_view(&f) {
                        view.emit_cancel();
                    }
                }
            }
        }
    }

    pub fn add_listener(
        &mut self,
        path: &Path,
        filter: &QueryFilter,
        ty: EventType,
        scheduler: &mut Scheduler,
        cb: Listener,
    ) -> (ListenerId, bool) {
        let relevant = self.write_log.relevant_to(path);
        let node = self.node_mut(path);
        let view = node.sync_point.view_mut(filter);
        if view.local_version() == &Tsd::Nil && !relevant.is_empty() {
            view.refresh(&relevant);
        }
        view.add_listener(ty, scheduler, cb)
    }

    pub fn remove_listener(&mut self, path: &Path, filter: &QueryFilter, ty: EventType, id: ListenerId) -> bool {
        let Some(node) = self.node_mut_if_present(path) else { return true };
        let now_empty = node.sync_point.view_mut(filter).remove_listener(ty, id);
        node.sync_point.prune_unlistened();
        now_empty
    }

    // -- recompute / emit -------------------------------------------------

    fn refresh_subtree(&mut self, path: &Path) {
        self.refresh_node_recursive(path.clone());
    }

    /// Every SyncPoint whose subtree intersects `changed_path` needs its
    /// views refolded: ancestors (the write narrows into their subtree),
    /// the node itself, and descendants (the write may fully cover them).
    fn refresh_everything_touching(&mut self, changed_path: &Path) {
        self.refresh_ancestors(changed_path);
        self.refresh_subtree(changed_path);
    }

    fn refresh_ancestors(&mut self, changed_path: &Path) {
        let mut prefix = Path::root();
        self.refresh_node_recursive_single(&prefix);
        for name in changed_path.parts() {
            prefix = prefix.child(name.clone());
            if prefix == *changed_path {
                break;
            }
            self.refresh_node_recursive_single(&prefix);
        }
    }

    fn refresh_node_recursive_single(&mut self, path: &Path) {
        let relevant = self.write_log.relevant_to(path);
        if let Some(node) = self.node_mut_if_present(path) {
            for view in node.sync_point.views_mut() {
                view.refresh(&relevant);
            }
        }
    }

    fn refresh_node_recursive(&mut self, path: Path) {
        self.refresh_node_recursive_single(&path);
        let Some(node) = self.node_mut_if_present(&path) else { return };
        let child_names: Vec<Name> = node.children.keys().cloned().collect();
        for name in child_names {
            self.refresh_node_recursive(path.child(name));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use submerge_lang::Scalar;

    fn leaf(n: f64) -> Tsd {
        Tsd::leaf(Scalar::Num(ordered_float::OrderedFloat(n)))
    }

    fn capture() -> (Listener, Rc<RefCell<Vec<crate::view::Event>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let events2 = events.clone();
        (crate::view::listener(move |e| events2.borrow_mut().push(e)), events)
    }

    #[test]
    fn listen_then_server_overwrite_delivers_value_inline_and_on_next_tick() {
        let mut tree = SyncTree::new();
        let path = Path::from_wire("/a").unwrap();

        // Registering a listener is what makes the server send data in the
        // real protocol, so a view always exists before any actionSet for
        // its (path, filter) can arrive.
        let mut sched = Scheduler::new();
        let (cb, events) = capture();
        tree.add_listener(&path, &QueryFilter::unfiltered(), EventType::Value, &mut sched, cb);
        assert!(events.borrow().is_empty());
        sched.drain();
        assert_eq!(*events.borrow(), vec![crate::view::Event::Value(Tsd::Nil)]);
        events.borrow_mut().clear();

        tree.apply_server_overwrite(&path, None, leaf(1.0));
        assert_eq!(*events.borrow(), vec![crate::view::Event::Value(leaf(1.0))]);
    }

    #[test]
    fn user_overwrite_is_visible_locally_before_any_ack() {
        let mut tree = SyncTree::new();
        let path = Path::from_wire("/a").unwrap();
        let mut sched = Scheduler::new();
        let (cb, events) = capture();
        tree.add_listener(&path, &QueryFilter::unfiltered(), EventType::Value, &mut sched, cb);
        sched.drain();
        events.borrow_mut().clear();

        tree.apply_user_overwrite(1, path.clone(), leaf(5.0));
        assert_eq!(*events.borrow(), vec![crate::view::Event::Value(leaf(5.0))]);
    }

    #[test]
    fn ack_drops_the_write_log_entry() {
        let mut tree = SyncTree::new();
        let path = Path::from_wire("/a").unwrap();
        tree.apply_user_overwrite(1, path.clone(), leaf(5.0));
        tree.apply_ack(1, &path);
        // No view was ever registered, so nothing was cached regardless.
        assert_eq!(tree.cached_value(&path, &QueryFilter::unfiltered()), None);
        // Registering one now sees the server's (still empty) state, since
        // the acked write is gone from the log and nothing has echoed it.
        let mut sched = Scheduler::new();
        let (cb, events) = capture();
        tree.add_listener(&path, &QueryFilter::unfiltered(), EventType::Value, &mut sched, cb);
        sched.drain();
        assert_eq!(*events.borrow(), vec![crate::view::Event::Value(Tsd::Nil)]);
    }

    #[test]
    fn ancestor_overwrite_propagates_into_deeper_listens() {
        let mut tree = SyncTree::new();
        let child_path = Path::from_wire("/a/b").unwrap();
        let mut sched = Scheduler::new();
        let (cb, events) = capture();
        tree.add_listener(&child_path, &QueryFilter::unfiltered(), EventType::Value, &mut sched, cb);
        sched.drain();
        events.borrow_mut().clear();

        let whole = Tsd::Nil.set_at_path(&[Name::new("a"), Name::new("b")], leaf(9.0));
        tree.apply_server_overwrite(&Path::root(), None, whole);

        assert_eq!(*events.borrow(), vec![crate::view::Event::Value(leaf(9.0))]);
    }

    #[test]
    fn listen_revoked_fires_cancel() {
        let mut tree = SyncTree::new();
        let path = Path::from_wire("/a").unwrap();
        let mut sched = Scheduler::new();
        let (cb, events) = capture();
        tree.add_listener(&path, &QueryFilter::unfiltered(), EventType::Cancel, &mut sched, cb);
        tree.apply_listen_revoked(&path, None);
        assert_eq!(*events.borrow(), vec![crate::view::Event::Cancel]);
    }
}
