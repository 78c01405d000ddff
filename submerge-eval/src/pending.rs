use std::collections::BTreeMap;

use submerge_lang::{Name, Path, Tsd};

/// What a pending write does to the subtree at its path (spec.md §3).
#[derive(Clone, Debug, PartialEq)]
pub enum WriteKind {
    Overwrite(Tsd),
    Merge(BTreeMap<Name, Tsd>),
}

/// `{writeId, path, kind, visibility}` from spec.md §3. `path` is absolute,
/// relative to the repo root. `apply_locally` is false for writes that affect
/// only `onDisconnect`-style server bookkeeping without a local echo; every
/// `SyncTree` write in this crate sets it true.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingWrite {
    pub write_id: u64,
    pub path: Path,
    pub kind: WriteKind,
    pub apply_locally: bool,
}

/// A write as it bears on one particular subtree: `rel_path` has been
/// reprojected relative to that subtree's root, and a write whose original
/// path was an ancestor of the subtree has already been narrowed down to just
/// the part of its value that falls under the subtree.
#[derive(Clone, Debug, PartialEq)]
pub struct RelevantWrite {
    pub write_id: u64,
    pub rel_path: Path,
    pub kind: WriteKind,
    pub apply_locally: bool,
}

/// The global ordered sequence of pending writes (spec.md §3, "Write log").
/// Each [`crate::View`] asks this for the slice of writes relevant to its own
/// subtree rather than keeping a private copy, so a newly-created view can
/// see writes that predate it.
#[derive(Default)]
pub struct WriteLog {
    writes: Vec<PendingWrite>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `writeId` is caller-assigned and strictly increasing across calls
    /// (spec.md §4.4), so appending preserves the log's sort order.
    pub fn push(&mut self, write: PendingWrite) {
        debug_assert!(self.writes.last().map_or(true, |w| w.write_id < write.write_id));
        self.writes.push(write);
    }

    pub fn remove(&mut self, write_id: u64) -> Option<PendingWrite> {
        let idx = self.writes.iter().position(|w| w.write_id == write_id)?;
        Some(self.writes.remove(idx))
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Writes bearing on `subtree_path`, in write-id order, reprojected
    /// relative to it. A write at or below `subtree_path` keeps its kind and
    /// is reprojected by dropping the shared prefix; a write strictly above
    /// `subtree_path` is narrowed to an overwrite of just the part of its
    /// value that covers the subtree.
    pub fn relevant_to(&self, subtree_path: &Path) -> Vec<RelevantWrite> {
        self.writes.iter().filter_map(|w| self.project(w, subtree_path)).collect()
    }

    fn project(&self, w: &PendingWrite, subtree_path: &Path) -> Option<RelevantWrite> {
        if let Some(rel) = w.path.strip_prefix(subtree_path) {
            return Some(RelevantWrite {
                write_id: w.write_id,
                rel_path: rel,
                kind: w.kind.clone(),
                apply_locally: w.apply_locally,
            });
        }
        let suffix = subtree_path.strip_prefix(&w.path)?;
        let narrowed = match &w.kind {
            WriteKind::Overwrite(tsd) => tsd.get_at_path(suffix.parts()),
            WriteKind::Merge(children) => {
                let (head, rest) = suffix.split_front()?;
                let child_tsd = children.get(head)?;
                child_tsd.get_at_path(rest.parts())
            }
        };
        Some(RelevantWrite {
            write_id: w.write_id,
            rel_path: Path::root(),
            kind: WriteKind::Overwrite(narrowed),
            apply_locally: w.apply_locally,
        })
    }
}
