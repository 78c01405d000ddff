use std::collections::BTreeMap;

use submerge_eval::SyncTree;
use submerge_lang::{Name, Path, Tsd};
use submerge_txn::{Outcome, TransactionsTree};

use crate::sparse::SparseSnapshotTree;

/// Client-side bookkeeping for registered `onDisconnect` actions
/// (spec.md §4.7): the server executes these when this connection drops,
/// but since there is no server in this crate, [`OnDisconnectManager::run`]
/// simulates that handler locally once the `Connection` reports the loss.
#[derive(Default)]
pub struct OnDisconnectManager {
    tree: SparseSnapshotTree,
}

impl OnDisconnectManager {
    pub fn new() -> OnDisconnectManager {
        OnDisconnectManager::default()
    }

    pub fn put(&mut self, path: &Path, value: Tsd) {
        self.tree.remember(path.parts(), value);
    }

    /// A merge is recorded as a `remember` of each changed child, the same
    /// per-child-overwrite treatment `SyncTree::apply_server_merge` gives a
    /// live merge.
    pub fn merge(&mut self, path: &Path, changed: &BTreeMap<Name, Tsd>) {
        for (name, value) in changed {
            let child_path = path.child(name.clone());
            self.tree.remember(child_path.parts(), value.clone());
        }
    }

    pub fn cancel(&mut self, path: &Path) {
        self.tree.forget(path.parts());
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// `runOnDisconnectEvents` (spec.md §4.7): resolve every stored value's
    /// sentinels against `server_time_ms`, apply each as an unfiltered
    /// server overwrite, abort any transaction outstanding at that path, and
    /// clear the sparse tree. Returns every aborted transaction's outcome so
    /// the caller can finalize it — a `Sent`-phase transaction only
    /// transitions to `sentNeedsAbort` here and needs a later finalization
    /// pass when its in-flight put's response arrives, but a `Run`-phase one
    /// finalizes immediately and must not be dropped on the floor.
    pub fn run(
        &mut self,
        sync_tree: &mut SyncTree,
        transactions: &mut TransactionsTree,
        server_time_ms: i64,
    ) -> Vec<(u64, Outcome)> {
        let mut leaves = Vec::new();
        self.tree.collect_leaves(Path::root(), &mut leaves);
        let mut aborted = Vec::new();
        for (path, tsd) in &leaves {
            let resolved = tsd.resolve_sentinels(server_time_ms);
            sync_tree.apply_server_overwrite(path, None, resolved);
            aborted.extend(transactions.abort_overlapping(path));
        }
        self.tree = SparseSnapshotTree::new();
        aborted
    }
}
