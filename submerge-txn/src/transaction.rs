use submerge_lang::Tsd;

/// The caller-supplied update: given the current local value, return the
/// value to write, or `None` to abort without ever sending anything
/// (spec.md §4.6).
pub type UpdateFn = Box<dyn FnMut(&Tsd) -> Option<Tsd>>;

/// Why a transaction ended without committing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransactionAbort {
    /// A direct `set`/`update` landed on an overlapping path while this
    /// transaction was outstanding.
    Set,
    /// Retried past the configured cap without the server accepting a write.
    MaxRetries,
    /// The update function returned `None`, or the server rejected the
    /// write for a reason other than staleness.
    User(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Committed(Tsd),
    Aborted(TransactionAbort),
}

/// A transaction's lifecycle phase (spec.md §4.6). Unlike most state in this
/// workspace this can't derive `Eq`/`Hash`/`Ord`: it owns a `FnMut` closure,
/// which has no such structure.
pub(crate) enum Phase {
    /// Needs `(current_value)` run through `update` and, if it returns
    /// `Some`, sent as a `put`.
    Run,
    /// A `put` of `value` is in flight.
    Sent { value: Tsd },
    /// An `abort(path)` landed while this transaction's `put` was in flight:
    /// finalize with `reason` whenever the server responds, whatever that
    /// response turns out to be.
    SentNeedsAbort { reason: TransactionAbort },
}

pub(crate) struct Transaction {
    pub write_id: u64,
    pub update: UpdateFn,
    pub retries: u32,
    pub phase: Phase,
    /// Process-wide monotonic creation order (spec.md §4.6 "composite
    /// output"): when two transactions touch overlapping paths, the
    /// higher-`order` one's output dominates the lower's at the overlap.
    pub order: u64,
}
