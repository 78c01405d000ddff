use std::collections::BTreeMap;

use submerge_lang::{Name, Path, Tsd};

use crate::hash::content_hash;
use crate::transaction::{Outcome, Phase, Transaction, TransactionAbort, UpdateFn};

/// One transaction's own optimistic write, to be applied to the `SyncTree`
/// under its own `write_id` — distinct from the composite `PendingSend`
/// actually put to the server, which may bundle several of these together.
pub struct StagedWrite {
    pub write_id: u64,
    pub path: Path,
    pub value: Tsd,
}

/// What the caller (the `Repo` coordinator) must send over the `Connection`
/// as a result of staging one round of transactions: a single conditional
/// put of the composed value for the whole ready subtree rooted at `path`
/// (spec.md §4.6 "composite output").
pub struct PendingSend {
    pub path: Path,
    pub data: Tsd,
    pub expected_hash: String,
}

/// Result of one [`TransactionsTree::stage`] call.
#[derive(Default)]
pub struct StageResult {
    /// Per-transaction optimistic writes newly moved into `Sent`, for the
    /// caller to apply to its `SyncTree` under each transaction's own
    /// `write_id`.
    pub writes: Vec<StagedWrite>,
    /// The one composite put to send, if the subtree became ready this
    /// round.
    pub send: Option<PendingSend>,
    /// Transactions that finished without ever reaching the server (the
    /// update function declined to write).
    pub done: Vec<(u64, Outcome)>,
}

#[derive(Default)]
struct TransactionsNode {
    transactions: Vec<Transaction>,
    children: BTreeMap<Name, TransactionsNode>,
}

/// Path-indexed collection of in-flight optimistic transactions
/// (spec.md §4.6), mirroring `submerge_eval::SyncTree`'s trie-of-paths shape.
/// This crate holds no reference to the `SyncTree` or `Connection`: the
/// caller feeds in the current local value and drains `PendingSend`s,
/// keeping the transaction state machine free of I/O.
pub struct TransactionsTree {
    root: TransactionsNode,
    max_retries: u32,
    next_order: u64,
}

impl TransactionsTree {
    pub fn new(max_retries: u32) -> TransactionsTree {
        TransactionsTree { root: TransactionsNode::default(), max_retries, next_order: 0 }
    }

    fn node_mut<'a>(root: &'a mut TransactionsNode, path: &Path) -> &'a mut TransactionsNode {
        let mut node = root;
        for name in path.parts() {
            node = node.children.entry(name.clone()).or_default();
        }
        node
    }

    fn node_mut_if_present<'a>(
        root: &'a mut TransactionsNode,
        path: &Path,
    ) -> Option<&'a mut TransactionsNode> {
        let mut node = root;
        for name in path.parts() {
            node = node.children.get_mut(name)?;
        }
        Some(node)
    }

    /// Register a new transaction at `path`, in the `Run` phase. Callers
    /// must immediately follow with [`TransactionsTree::staging_root`] and
    /// [`TransactionsTree::stage`] so its first attempt is computed and
    /// sent.
    pub fn start(&mut self, write_id: u64, path: &Path, update: UpdateFn) {
        let order = self.next_order;
        self.next_order += 1;
        let node = Self::node_mut(&mut self.root, path);
        node.transactions.push(Transaction { write_id, update, retries: 0, phase: Phase::Run, order });
    }

    /// The node a write at `changed_path` should be staged from: the highest
    /// ancestor (closest to root, inclusive of `changed_path` itself) that
    /// already holds a queued transaction. Composing from there rather than
    /// from `changed_path` directly ensures an overlapping transaction above
    /// `changed_path` is folded into the same put instead of racing an
    /// independent CAS against it (spec.md §4.6's "composite output").
    pub fn staging_root(&self, changed_path: &Path) -> Path {
        let mut node = &self.root;
        if !node.transactions.is_empty() {
            return Path::root();
        }
        let mut prefix = Vec::new();
        for name in changed_path.parts() {
            match node.children.get(name) {
                Some(child) => {
                    node = child;
                    prefix.push(name.clone());
                    if !node.transactions.is_empty() {
                        return Path::from_names(prefix);
                    }
                }
                None => break,
            }
        }
        changed_path.clone()
    }

    /// Run every `Run`-phase transaction in the subtree rooted at `path`
    /// against `current_value` and, if the whole subtree is ready (every
    /// transaction in it was in `Run` phase to begin with — nothing else
    /// still has a put in flight), compose and return a single put for the
    /// whole subtree.
    pub fn stage(&mut self, path: &Path, current_value: &Tsd) -> StageResult {
        let Some(root_node) = Self::node_mut_if_present(&mut self.root, path) else {
            return StageResult::default();
        };
        if !Self::subtree_all_run(root_node) {
            // Something in this composite subtree already has a put in
            // flight; wait for it to resolve before assembling a new one.
            return StageResult::default();
        }
        let mut writes = Vec::new();
        let mut done = Vec::new();
        Self::run_subtree(root_node, path, current_value, &mut writes, &mut done);
        let send = if Self::subtree_has_any(root_node) {
            Some(PendingSend {
                path: path.clone(),
                data: Self::composite_output(root_node, current_value),
                expected_hash: content_hash(current_value),
            })
        } else {
            None
        };
        StageResult { writes, send, done }
    }

    fn subtree_all_run(node: &TransactionsNode) -> bool {
        node.transactions.iter().all(|t| matches!(t.phase, Phase::Run))
            && node.children.values().all(Self::subtree_all_run)
    }

    fn subtree_has_any(node: &TransactionsNode) -> bool {
        !node.transactions.is_empty() || node.children.values().any(Self::subtree_has_any)
    }

    fn subtree_max_order(node: &TransactionsNode) -> Option<u64> {
        let own = node.transactions.iter().map(|t| t.order).max();
        let children = node.children.values().filter_map(Self::subtree_max_order).max();
        match (own, children) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    fn run_subtree(
        node: &mut TransactionsNode,
        node_path: &Path,
        local: &Tsd,
        writes: &mut Vec<StagedWrite>,
        done: &mut Vec<(u64, Outcome)>,
    ) {
        let mut remaining = Vec::new();
        for mut txn in node.transactions.drain(..) {
            match (txn.update)(local) {
                Some(new_value) => {
                    writes.push(StagedWrite {
                        write_id: txn.write_id,
                        path: node_path.clone(),
                        value: new_value.clone(),
                    });
                    txn.phase = Phase::Sent { value: new_value };
                    remaining.push(txn);
                }
                None => done.push((
                    txn.write_id,
                    Outcome::Aborted(TransactionAbort::User(
                        "transaction update function returned no value".into(),
                    )),
                )),
            }
        }
        node.transactions = remaining;
        let child_names: Vec<Name> = node.children.keys().cloned().collect();
        for name in child_names {
            let child_path = node_path.child(name.clone());
            let child_local = local.child(&name);
            if let Some(child) = node.children.get_mut(&name) {
                Self::run_subtree(child, &child_path, &child_local, writes, done);
            }
        }
    }

    /// `input`, overlaid with this node's own last (highest-`order`) `Sent`
    /// transaction's output, then overlaid again by every child subtree
    /// whose `order` outranks that — "later-numbered transactions dominate
    /// earlier ones at overlapping paths" (spec.md §4.6).
    fn composite_output(node: &TransactionsNode, local: &Tsd) -> Tsd {
        let own_sent = node
            .transactions
            .iter()
            .filter_map(|t| match &t.phase {
                Phase::Sent { value } => Some((t.order, value)),
                _ => None,
            })
            .max_by_key(|(order, _)| *order);
        let mut out = match own_sent {
            Some((_, value)) => value.clone(),
            None => local.clone(),
        };
        let own_order = own_sent.map(|(order, _)| order);
        for (name, child) in &node.children {
            let dominates = match (Self::subtree_max_order(child), own_order) {
                (Some(c), Some(o)) => c > o,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if dominates {
                let child_local = local.child(name);
                let child_value = Self::composite_output(child, &child_local);
                out = out.set_at_path(std::slice::from_ref(name), child_value);
            }
        }
        out
    }

    /// The server accepted the composite put sent for the subtree rooted at
    /// `path`: every `Sent`/`SentNeedsAbort` transaction in it finalizes —
    /// committed, or aborted if it had been marked for abort while in
    /// flight (spec.md §4.6 "Ack success").
    pub fn ack(&mut self, path: &Path) -> Vec<(u64, Outcome)> {
        let Some(node) = Self::node_mut_if_present(&mut self.root, path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        Self::ack_subtree(node, &mut out);
        out
    }

    fn ack_subtree(node: &mut TransactionsNode, out: &mut Vec<(u64, Outcome)>) {
        let mut remaining = Vec::new();
        for txn in node.transactions.drain(..) {
            match txn.phase {
                Phase::Sent { value } => out.push((txn.write_id, Outcome::Committed(value))),
                Phase::SentNeedsAbort { reason } => out.push((txn.write_id, Outcome::Aborted(reason))),
                Phase::Run => remaining.push(txn),
            }
        }
        node.transactions = remaining;
        for child in node.children.values_mut() {
            Self::ack_subtree(child, out);
        }
    }

    /// The server rejected the composite put at `path` as stale
    /// (`datastale`): every `Sent`-phase transaction's prior optimistic
    /// write is retracted (returned in the first `Vec` for the caller to
    /// reject from its `SyncTree`), then either requeued in `Run` phase to
    /// rerun against fresh input, or — past the retry cap — finalized with
    /// `maxRetries`. Anything already marked `SentNeedsAbort` finalizes with
    /// its stored reason instead (spec.md §4.6).
    pub fn stale(&mut self, path: &Path) -> (Vec<u64>, Vec<(u64, Outcome)>) {
        let Some(node) = Self::node_mut_if_present(&mut self.root, path) else {
            return (Vec::new(), Vec::new());
        };
        let mut reset = Vec::new();
        let mut done = Vec::new();
        Self::stale_subtree(node, self.max_retries, &mut reset, &mut done);
        (reset, done)
    }

    fn stale_subtree(
        node: &mut TransactionsNode,
        max_retries: u32,
        reset: &mut Vec<u64>,
        done: &mut Vec<(u64, Outcome)>,
    ) {
        let mut remaining = Vec::new();
        for mut txn in node.transactions.drain(..) {
            match txn.phase {
                Phase::Sent { .. } => {
                    reset.push(txn.write_id);
                    if txn.retries >= max_retries {
                        done.push((txn.write_id, Outcome::Aborted(TransactionAbort::MaxRetries)));
                    } else {
                        txn.retries += 1;
                        txn.phase = Phase::Run;
                        remaining.push(txn);
                    }
                }
                Phase::SentNeedsAbort { reason } => {
                    reset.push(txn.write_id);
                    done.push((txn.write_id, Outcome::Aborted(reason)));
                }
                Phase::Run => remaining.push(txn),
            }
        }
        node.transactions = remaining;
        for child in node.children.values_mut() {
            Self::stale_subtree(child, max_retries, reset, done);
        }
    }

    /// The server rejected the composite put at `path` for a reason other
    /// than staleness: finalize every `Sent`/`SentNeedsAbort` transaction in
    /// the subtree with the server's error (or its stored abort reason, if
    /// it was already marked `SentNeedsAbort`).
    pub fn server_error(&mut self, path: &Path, code: String) -> Vec<(u64, Outcome)> {
        let Some(node) = Self::node_mut_if_present(&mut self.root, path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        Self::server_error_subtree(node, &code, &mut out);
        out
    }

    fn server_error_subtree(node: &mut TransactionsNode, code: &str, out: &mut Vec<(u64, Outcome)>) {
        let mut remaining = Vec::new();
        for txn in node.transactions.drain(..) {
            match txn.phase {
                Phase::Sent { .. } => {
                    out.push((txn.write_id, Outcome::Aborted(TransactionAbort::User(code.to_string()))))
                }
                Phase::SentNeedsAbort { reason } => out.push((txn.write_id, Outcome::Aborted(reason))),
                Phase::Run => remaining.push(txn),
            }
        }
        node.transactions = remaining;
        for child in node.children.values_mut() {
            Self::server_error_subtree(child, code, out);
        }
    }

    /// A direct `set`/`update`, or an onDisconnect replay, landed at
    /// `changed_path` while transactions were outstanding on an overlapping
    /// path. Per spec.md §4.6's abort semantics: a `Run`-phase transaction
    /// fails immediately (it never reached the server); a `Sent`-phase one
    /// is only marked `SentNeedsAbort` and finalizes later, when its
    /// in-flight put's response arrives, so a stray ack can't be mistaken
    /// for a commit; `SentNeedsAbort` is left alone (already pending
    /// finalization).
    pub fn abort_overlapping(&mut self, changed_path: &Path) -> Vec<(u64, Outcome)> {
        let mut aborted = Vec::new();
        Self::collect_overlap(&mut self.root, Path::root(), changed_path, &mut aborted);
        aborted
    }

    fn collect_overlap(
        node: &mut TransactionsNode,
        node_path: Path,
        changed_path: &Path,
        out: &mut Vec<(u64, Outcome)>,
    ) {
        if node_path.starts_with(changed_path) || changed_path.starts_with(&node_path) {
            let mut remaining = Vec::new();
            for mut txn in node.transactions.drain(..) {
                match txn.phase {
                    Phase::Run => out.push((txn.write_id, Outcome::Aborted(TransactionAbort::Set))),
                    Phase::Sent { .. } => {
                        txn.phase = Phase::SentNeedsAbort { reason: TransactionAbort::Set };
                        remaining.push(txn);
                    }
                    Phase::SentNeedsAbort { .. } => remaining.push(txn),
                }
            }
            node.transactions = remaining;
        }
        let child_names: Vec<Name> = node.children.keys().cloned().collect();
        for name in child_names {
            let child_path = node_path.child(name.clone());
            if let Some(child) = node.children.get_mut(&name) {
                Self::collect_overlap(child, child_path, changed_path, out);
            }
        }
    }
}
