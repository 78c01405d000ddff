use std::cmp::Ordering;
use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::name::Name;

/// The reserved `ServerValue.timestamp` sentinel (spec.md §6). Resolved to a
/// concrete numeric value at write-creation time; the unresolved form is
/// retained for onDisconnect replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ServerSentinel {
    Timestamp,
}

/// A leaf scalar value. `Sentinel` only ever appears in a write still awaiting
/// resolution against a server clock.
#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Num(OrderedFloat<f64>),
    Str(String),
    Sentinel(ServerSentinel),
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(s: &Scalar) -> u8 {
            match s {
                Scalar::Null => 0,
                Scalar::Bool(false) => 1,
                Scalar::Bool(true) => 2,
                Scalar::Num(_) => 3,
                Scalar::Str(_) => 4,
                Scalar::Sentinel(_) => 5,
            }
        }
        match (self, other) {
            (Scalar::Num(a), Scalar::Num(b)) => a.cmp(b),
            (Scalar::Str(a), Scalar::Str(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}
impl Eq for Scalar {}
impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A node or write priority: numeric priorities sort before string
/// priorities; within a kind, by value.
#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize)]
pub enum Priority {
    Num(OrderedFloat<f64>),
    Str(String),
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Priority::Num(a), Priority::Num(b)) => a.cmp(b),
            (Priority::Str(a), Priority::Str(b)) => a.cmp(b),
            (Priority::Num(_), Priority::Str(_)) => Ordering::Less,
            (Priority::Str(_), Priority::Num(_)) => Ordering::Greater,
        }
    }
}
impl Eq for Priority {}
impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Recursive tree-structured-data value (spec.md §3). A leaf and children
/// are mutually exclusive after normalization; `Nil` denotes absence.
#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize, Default)]
pub enum Tsd {
    #[default]
    Nil,
    Leaf {
        value: Scalar,
        priority: Option<Priority>,
    },
    Node {
        children: BTreeMap<Name, Tsd>,
        priority: Option<Priority>,
    },
}

impl Eq for Tsd {}

impl Ord for Tsd {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(t: &Tsd) -> u8 {
            match t {
                Tsd::Nil => 0,
                Tsd::Leaf { .. } => 1,
                Tsd::Node { .. } => 2,
            }
        }
        match (self, other) {
            (Tsd::Nil, Tsd::Nil) => Ordering::Equal,
            (Tsd::Leaf { value: a, .. }, Tsd::Leaf { value: b, .. }) => a.cmp(b),
            (Tsd::Node { children: a, .. }, Tsd::Node { children: b, .. }) => {
                a.iter().cmp(b.iter())
            }
            _ => rank(self).cmp(&rank(other)),
        }
    }
}
impl PartialOrd for Tsd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Tsd {
    pub fn leaf(value: Scalar) -> Tsd {
        Tsd::Leaf { value, priority: None }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Tsd::Nil)
    }

    pub fn priority(&self) -> Option<&Priority> {
        match self {
            Tsd::Nil => None,
            Tsd::Leaf { priority, .. } | Tsd::Node { priority, .. } => priority.as_ref(),
        }
    }

    pub fn with_priority(self, priority: Option<Priority>) -> Tsd {
        match self {
            Tsd::Nil => Tsd::Nil,
            Tsd::Leaf { value, .. } => Tsd::Leaf { value, priority },
            Tsd::Node { children, .. } => Tsd::Node { children, priority },
        }
    }

    /// The child named `name`, or `Nil` if this node has no such child (or is
    /// not a `Node` at all).
    pub fn child(&self, name: &Name) -> Tsd {
        match self {
            Tsd::Node { children, .. } => children.get(name).cloned().unwrap_or_default(),
            _ => Tsd::Nil,
        }
    }

    pub fn children(&self) -> Box<dyn Iterator<Item = (&Name, &Tsd)> + '_> {
        match self {
            Tsd::Node { children, .. } => Box::new(children.iter()),
            _ => Box::new(std::iter::empty()),
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Tsd::Node { children, .. } => children.len(),
            _ => 0,
        }
    }

    /// Place `child` at `name`, clearing any leaf value this node carried
    /// (spec.md §3 invariant). Removing the last child collapses the node
    /// back to `Nil`.
    fn with_child(&self, name: Name, child: Tsd) -> Tsd {
        let priority = self.priority().cloned();
        let mut children = match self {
            Tsd::Node { children, .. } => children.clone(),
            _ => BTreeMap::new(),
        };
        if child.is_nil() {
            children.remove(&name);
        } else {
            children.insert(name, child);
        }
        if children.is_empty() {
            Tsd::Nil
        } else {
            Tsd::Node { children, priority }
        }
    }

    /// Replace the subtree at `path` wholesale with `value`, returning the
    /// new root. Used for both server and user overwrite application.
    pub fn set_at_path(&self, path: &[Name], value: Tsd) -> Tsd {
        match path.split_first() {
            None => value,
            Some((head, rest)) => {
                let new_child = self.child(head).set_at_path(rest, value);
                self.with_child(head.clone(), new_child)
            }
        }
    }

    /// Read the subtree at `path`, or `Nil` if any step is absent.
    pub fn get_at_path(&self, path: &[Name]) -> Tsd {
        match path.split_first() {
            None => self.clone(),
            Some((head, rest)) => self.child(head).get_at_path(rest),
        }
    }

    /// Overwrite each named child in `changed`, preserving children not
    /// mentioned (spec.md §4.4 merge semantics).
    pub fn merge_children(&self, changed: &BTreeMap<Name, Tsd>) -> Tsd {
        let mut result = self.clone();
        for (name, value) in changed {
            result = result.with_child(name.clone(), value.clone());
        }
        result
    }

    /// Resolve `ServerValue.timestamp` sentinels against `server_time_ms`,
    /// recursively.
    pub fn resolve_sentinels(&self, server_time_ms: i64) -> Tsd {
        match self {
            Tsd::Nil => Tsd::Nil,
            Tsd::Leaf { value, priority } => {
                let value = match value {
                    Scalar::Sentinel(ServerSentinel::Timestamp) => {
                        Scalar::Num(OrderedFloat(server_time_ms as f64))
                    }
                    other => other.clone(),
                };
                Tsd::Leaf { value, priority: priority.clone() }
            }
            Tsd::Node { children, priority } => Tsd::Node {
                children: children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve_sentinels(server_time_ms)))
                    .collect(),
                priority: priority.clone(),
            },
        }
    }
}
