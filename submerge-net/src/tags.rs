use std::collections::HashMap;

use submerge_lang::{Path, QueryFilter};

/// Bijection `QueryFilter ↔ integer tag`, per listen, used to correlate
/// server pushes back to the filter that requested them (spec.md §3).
/// Revoking a tag removes both directions (spec.md §9's open question).
#[derive(Default)]
pub struct TagTable {
    next_tag: i64,
    forward: HashMap<(Path, QueryFilter), i64>,
    reverse: HashMap<i64, (Path, QueryFilter)>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tag for `(path, filter)`, allocating one if this is the
    /// first time this filter has been listened to.
    pub fn tag_for(&mut self, path: &Path, filter: &QueryFilter) -> i64 {
        let key = (path.clone(), filter.clone());
        if let Some(&tag) = self.forward.get(&key) {
            return tag;
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        self.forward.insert(key.clone(), tag);
        self.reverse.insert(tag, key);
        tag
    }

    pub fn lookup(&self, tag: i64) -> Option<&(Path, QueryFilter)> {
        self.reverse.get(&tag)
    }

    /// Remove both directions of the bijection for `(path, filter)`.
    pub fn revoke(&mut self, path: &Path, filter: &QueryFilter) {
        if let Some(tag) = self.forward.remove(&(path.clone(), filter.clone())) {
            self.reverse.remove(&tag);
        }
    }

    pub fn revoke_tag(&mut self, tag: i64) {
        if let Some(key) = self.reverse.remove(&tag) {
            self.forward.remove(&key);
        }
    }
}
