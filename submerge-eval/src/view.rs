use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use submerge_lang::{Name, QueryFilter, Tsd};
use submerge_net::Scheduler;

use crate::pending::{RelevantWrite, WriteKind};

/// One server-pushed or user-initiated change to a view's server-known state
/// (spec.md §4.2). Distinct from [`WriteKind`]: this is applied directly to
/// `server_version`, never layered through the write log.
#[derive(Clone, Debug)]
pub enum Operation {
    Overwrite(Tsd),
    Merge(std::collections::BTreeMap<Name, Tsd>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    Value,
    ChildAdded,
    ChildChanged,
    ChildMoved,
    ChildRemoved,
    Cancel,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Value(Tsd),
    ChildAdded { name: Name, value: Tsd },
    ChildChanged { name: Name, value: Tsd },
    ChildMoved { name: Name, value: Tsd },
    ChildRemoved { name: Name, value: Tsd },
    Cancel,
}

/// A registered callback. Rust closures have no stable identity to compare
/// for `removeListener`, so registration hands back a [`ListenerId`] token
/// instead; the shared `Rc<RefCell<_>>` lets [`View::add_listener`] both file
/// it for future emits and fire it once, deferred, for the initial snapshot.
pub type Listener = Rc<RefCell<dyn FnMut(Event)>>;

pub fn listener(f: impl FnMut(Event) + 'static) -> Listener {
    Rc::new(RefCell::new(f))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

/// One registered query's client-side state: the server's view of the
/// subtree (possibly partial, for a filtered query), the rendered local
/// value last emitted, and the listeners subscribed to its events
/// (spec.md §3, §4.2).
pub struct View {
    filter: QueryFilter,
    server_version: Tsd,
    local_version: Tsd,
    listeners: HashMap<EventType, Vec<(ListenerId, Listener)>>,
    next_listener_id: u64,
}

impl View {
    pub fn new(filter: QueryFilter) -> View {
        View {
            filter,
            server_version: Tsd::Nil,
            local_version: Tsd::Nil,
            listeners: HashMap::new(),
            next_listener_id: 0,
        }
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn local_version(&self) -> &Tsd {
        &self.local_version
    }

    pub fn has_listeners(&self) -> bool {
        self.listeners.values().any(|v| !v.is_empty())
    }

    /// Apply a server-pushed change to this view's known server state.
    /// Returns the new `server_version`, for the caller (the owning
    /// `SyncTree`) to fold into descendant views too.
    pub fn apply_server_operation(&mut self, op: Operation) -> Tsd {
        self.server_version = match op {
            Operation::Overwrite(tsd) => tsd,
            Operation::Merge(children) => self.server_version.merge_children(&children),
        };
        self.server_version.clone()
    }

    pub fn server_version(&self) -> &Tsd {
        &self.server_version
    }

    /// Fold `server_version` with `relevant` user writes (ordered by
    /// `writeId`), diff against the last rendered value, and fire events
    /// for the difference (spec.md §4.2, §4.4).
    pub fn refresh(&mut self, relevant: &[RelevantWrite]) {
        let mut acc = self.server_version.clone();
        for w in relevant {
            if !w.apply_locally {
                continue;
            }
            acc = match &w.kind {
                WriteKind::Overwrite(tsd) => acc.set_at_path(w.rel_path.parts(), tsd.clone()),
                WriteKind::Merge(children) => {
                    let node = acc.get_at_path(w.rel_path.parts());
                    let merged = node.merge_children(children);
                    acc.set_at_path(w.rel_path.parts(), merged)
                }
            };
        }
        let old = std::mem::replace(&mut self.local_version, acc.clone());
        self.diff_and_emit(&old, &acc);
    }

    /// The rendered "value" payload under this filter's window: the full
    /// subtree if unfiltered, otherwise a `Node` built from just the
    /// valid, windowed children.
    fn render(&self, tsd: &Tsd) -> Tsd {
        if self.filter.is_unfiltered() {
            return tsd.clone();
        }
        let entries = self.ordered_entries(tsd);
        if entries.is_empty() {
            return Tsd::Nil;
        }
        let children: BTreeMap<Name, Tsd> = entries.into_iter().collect();
        Tsd::Node { children, priority: tsd.priority().cloned() }
    }

    /// This filter's window over `tsd`'s children, in display order (which,
    /// for `orderBy: priority|value|child`, need not match `Name` order and
    /// so cannot be read back off a `Tsd::Node`'s `BTreeMap`).
    fn ordered_entries(&self, tsd: &Tsd) -> Vec<(Name, Tsd)> {
        let refs: Vec<(&Name, &Tsd)> =
            tsd.children().filter(|(n, c)| self.filter.is_valid(n, c)).collect();
        self.filter.window(refs).into_iter().map(|(n, t)| (n.clone(), t.clone())).collect()
    }

    /// Removals, then moves, then additions, then changes, then value
    /// (spec.md §4.2's ordering within one operation).
    fn diff_and_emit(&mut self, old_full: &Tsd, new_full: &Tsd) {
        let old_entries = self.ordered_entries(old_full);
        let new_entries = self.ordered_entries(new_full);

        let old_index: HashMap<&Name, usize> =
            old_entries.iter().enumerate().map(|(i, (n, _))| (n, i)).collect();
        let new_index: HashMap<&Name, usize> =
            new_entries.iter().enumerate().map(|(i, (n, _))| (n, i)).collect();
        let old_values: HashMap<&Name, &Tsd> = old_entries.iter().map(|(n, t)| (n, t)).collect();

        for (name, value) in &old_entries {
            if !new_index.contains_key(name) {
                self.emit(EventType::ChildRemoved, Event::ChildRemoved {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
        for (name, value) in &new_entries {
            if let (Some(&oi), Some(&ni)) = (old_index.get(name), new_index.get(name)) {
                if oi != ni {
                    self.emit(EventType::ChildMoved, Event::ChildMoved {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        for (name, value) in &new_entries {
            if !old_index.contains_key(name) {
                self.emit(EventType::ChildAdded, Event::ChildAdded {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
        for (name, value) in &new_entries {
            if let Some(old_value) = old_values.get(name) {
                if *old_value != value {
                    self.emit(EventType::ChildChanged, Event::ChildChanged {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        let new_rendered = self.render(new_full);
        let old_rendered = self.render(old_full);
        if new_rendered != old_rendered {
            self.emit(EventType::Value, Event::Value(new_rendered));
        }
    }

    fn emit(&mut self, ty: EventType, event: Event) {
        let Some(bucket) = self.listeners.get(&ty) else { return };
        let callbacks: Vec<Listener> = bucket.iter().map(|(_, cb)| cb.clone()).collect();
        for cb in callbacks {
            (cb.borrow_mut())(event.clone());
        }
    }

    /// Register `cb` for `ty`. Returns the token for later removal and
    /// whether this was the first listener of this type (the caller uses
    /// that to decide whether a fresh `listen` needs to go out over the
    /// wire). The initial snapshot/child-added burst is deferred onto
    /// `scheduler` rather than fired inline (spec.md §4.2, §9).
    pub fn add_listener(
        &mut self,
        ty: EventType,
        scheduler: &mut Scheduler,
        cb: Listener,
    ) -> (ListenerId, bool) {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        let bucket = self.listeners.entry(ty).or_default();
        let was_first = bucket.is_empty();
        bucket.push((id, cb.clone()));

        match ty {
            EventType::Value => {
                let snapshot = self.render(&self.local_version);
                scheduler.defer(move || (cb.borrow_mut())(Event::Value(snapshot)));
            }
            EventType::ChildAdded => {
                let entries = self.ordered_entries(&self.local_version);
                scheduler.defer(move || {
                    for (name, value) in entries {
                        (cb.borrow_mut())(Event::ChildAdded { name, value });
                    }
                });
            }
            _ => {}
        }
        (id, was_first)
    }

    /// Returns whether this event type now has no listeners left.
    pub fn remove_listener(&mut self, ty: EventType, id: ListenerId) -> bool {
        match self.listeners.get_mut(&ty) {
            Some(bucket) => {
                bucket.retain(|(lid, _)| *lid != id);
                bucket.is_empty()
            }
            None => true,
        }
    }

    /// Fire a single `Cancel` event to this view's cancel listeners; used
    /// when the server revokes the listen backing this view (spec.md §9).
    pub fn emit_cancel(&mut self) {
        self.emit(EventType::Cancel, Event::Cancel);
    }
}
