use std::collections::BTreeMap;

use submerge_lang::{Name, Path, Tsd};

/// `{value?: TSD, children: map<Name, SparseSnapshotTree>}` (spec.md §4.7).
/// `value` and `children` are mutually exclusive per node: recording a
/// value at a node that already has children, or vice versa, collapses the
/// old shape into the new one.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SparseSnapshotTree {
    #[default]
    Empty,
    Value(Tsd),
    Children(BTreeMap<Name, SparseSnapshotTree>),
}

impl SparseSnapshotTree {
    pub fn new() -> SparseSnapshotTree {
        SparseSnapshotTree::Empty
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SparseSnapshotTree::Empty)
    }

    /// If `self` carries a `value`, expand it into per-child `Value` nodes
    /// (a scalar leaf has no children, so expanding one discards it); if
    /// `self` is `Empty`, start an empty `Children` map. A no-op if `self`
    /// is already `Children`.
    fn expand_to_children(&mut self) -> &mut BTreeMap<Name, SparseSnapshotTree> {
        if let SparseSnapshotTree::Value(v) = self {
            let children = v
                .children()
                .map(|(name, child)| (name.clone(), SparseSnapshotTree::Value(child.clone())))
                .collect();
            *self = SparseSnapshotTree::Children(children);
        } else if matches!(self, SparseSnapshotTree::Empty) {
            *self = SparseSnapshotTree::Children(BTreeMap::new());
        }
        match self {
            SparseSnapshotTree::Children(c) => c,
            _ => unreachable!(),
        }
    }

    /// Insert `tsd` at `path`, re-expanding any coarser value along the way
    /// so both the existing value at a sibling and the new, finer one
    /// coexist (spec.md §4.7).
    pub fn remember(&mut self, path: &[Name], tsd: Tsd) {
        match path.split_first() {
            None => *self = SparseSnapshotTree::Value(tsd),
            Some((head, rest)) => {
                let children = self.expand_to_children();
                children.entry(head.clone()).or_default().remember(rest, tsd);
            }
        }
    }

    /// Remove the entry at `path`, re-expanding a coarser ancestor value
    /// first if needed. Returns `true` if the node this was called on is
    /// now entirely empty.
    pub fn forget(&mut self, path: &[Name]) -> bool {
        match path.split_first() {
            None => {
                *self = SparseSnapshotTree::Empty;
                true
            }
            Some((head, rest)) => {
                let children = self.expand_to_children();
                let Some(child) = children.get_mut(head) else {
                    return children.is_empty();
                };
                if child.forget(rest) {
                    children.remove(head);
                }
                let now_empty = children.is_empty();
                if now_empty {
                    *self = SparseSnapshotTree::Empty;
                }
                now_empty
            }
        }
    }

    /// Every stored value, as absolute paths from `prefix`.
    pub fn collect_leaves(&self, prefix: Path, out: &mut Vec<(Path, Tsd)>) {
        match self {
            SparseSnapshotTree::Empty => {}
            SparseSnapshotTree::Value(v) => out.push((prefix, v.clone())),
            SparseSnapshotTree::Children(children) => {
                for (name, child) in children {
                    child.collect_leaves(prefix.child(name.clone()), out);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use submerge_lang::Scalar;

    fn leaf(n: f64) -> Tsd {
        Tsd::leaf(Scalar::Num(ordered_float::OrderedFloat(n)))
    }

    #[test]
    fn remember_under_a_value_expands_and_preserves_siblings() {
        let mut tree = SparseSnapshotTree::new();
        let whole = Tsd::Nil
            .set_at_path(&[Name::new("x")], leaf(1.0))
            .set_at_path(&[Name::new("y")], leaf(2.0));
        tree.remember(&[Name::new("a")], whole);
        tree.remember(&[Name::new("a"), Name::new("y")], leaf(9.0));

        let mut leaves = Vec::new();
        tree.collect_leaves(Path::root(), &mut leaves);
        leaves.sort_by(|a, b| a.0.to_wire().cmp(&b.0.to_wire()));
        assert_eq!(
            leaves,
            vec![
                (Path::from_wire("/a/x").unwrap(), leaf(1.0)),
                (Path::from_wire("/a/y").unwrap(), leaf(9.0)),
            ]
        );
    }

    #[test]
    fn forget_after_remember_leaves_the_tree_as_if_never_called() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&[Name::new("a")], leaf(1.0));
        assert!(tree.forget(&[Name::new("a")]));
        assert!(tree.is_empty());
    }

    #[test]
    fn forget_one_child_keeps_others() {
        let mut tree = SparseSnapshotTree::new();
        tree.remember(&[Name::new("a"), Name::new("x")], leaf(1.0));
        tree.remember(&[Name::new("a"), Name::new("y")], leaf(2.0));
        assert!(!tree.forget(&[Name::new("a"), Name::new("x")]));
        let mut leaves = Vec::new();
        tree.collect_leaves(Path::root(), &mut leaves);
        assert_eq!(leaves, vec![(Path::from_wire("/a/y").unwrap(), leaf(2.0))]);
    }
}
