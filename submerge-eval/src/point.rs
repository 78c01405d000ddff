use std::collections::HashMap;

use submerge_lang::QueryFilter;

use crate::view::View;

/// Every view currently registered at one path, keyed by the filter that
/// produced it; `QueryFilter::unfiltered()` is the "no query" case
/// (spec.md §3).
#[derive(Default)]
pub struct SyncPoint {
    views: HashMap<QueryFilter, View>,
}

impl SyncPoint {
    pub fn new() -> SyncPoint {
        SyncPoint::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn view_mut(&mut self, filter: &QueryFilter) -> &mut View {
        self.views.entry(filter.clone()).or_insert_with(|| View::new(filter.clone()))
    }

    pub fn view(&self, filter: &QueryFilter) -> Option<&View> {
        self.views.get(filter)
    }

    pub fn views_mut(&mut self) -> impl Iterator<Item = &mut View> {
        self.views.values_mut()
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn remove_view(&mut self, filter: &QueryFilter) -> Option<View> {
        self.views.remove(filter)
    }

    /// Drop every view with no remaining listeners; the caller has already
    /// told the server to stop listening on each one.
    pub fn prune_unlistened(&mut self) {
        self.views.retain(|_, v| v.has_listeners());
    }
}
