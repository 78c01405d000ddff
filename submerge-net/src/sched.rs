use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A FIFO queue of deferred zero-argument closures, standing in for "next
/// scheduler tick" in this synchronous core (SPEC_FULL.md §4.9). Listener
/// bootstrap events (spec.md §4.2, §9) are deferred onto one of these rather
/// than delivered inline with `addListener`.
#[derive(Default)]
pub struct Scheduler {
    queue: VecDeque<Box<dyn FnOnce()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, f: impl FnOnce() + 'static) {
        self.queue.push_back(Box::new(f));
    }

    /// Run every deferred closure, including ones newly deferred by closures
    /// that ran earlier in the same drain.
    pub fn drain(&mut self) {
        while let Some(f) = self.queue.pop_front() {
            f();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

enum PromiseState<T> {
    Pending,
    PendingWithContinuation(Box<dyn FnOnce(T)>),
    Fulfilled,
}

struct PromiseCell<T> {
    value: Option<T>,
    state: PromiseState<T>,
}

/// The read side of a single-shot completion handle (spec.md §9).
pub struct Promise<T> {
    cell: Rc<RefCell<PromiseCell<T>>>,
}

/// The write side. Firing it twice is a programming error, guarded here by
/// a debug assertion rather than silently accepted (per spec.md §9).
pub struct Completer<T> {
    cell: Rc<RefCell<PromiseCell<T>>>,
}

pub fn promise<T: 'static>() -> (Promise<T>, Completer<T>) {
    let cell = Rc::new(RefCell::new(PromiseCell { value: None, state: PromiseState::Pending }));
    (Promise { cell: cell.clone() }, Completer { cell })
}

impl<T: 'static> Completer<T> {
    pub fn complete(self, value: T) {
        let mut cell = self.cell.borrow_mut();
        debug_assert!(
            !matches!(cell.state, PromiseState::Fulfilled),
            "Promise completed twice"
        );
        let prior = std::mem::replace(&mut cell.state, PromiseState::Fulfilled);
        match prior {
            PromiseState::PendingWithContinuation(k) => {
                drop(cell);
                k(value);
            }
            _ => cell.value = Some(value),
        }
    }
}

impl<T: 'static> Promise<T> {
    /// Register `k` to run with the resolved value: immediately if this
    /// promise already resolved, otherwise when `complete` is next called.
    pub fn on_complete(self, k: impl FnOnce(T) + 'static) {
        let mut cell = self.cell.borrow_mut();
        if let Some(value) = cell.value.take() {
            drop(cell);
            k(value);
        } else {
            cell.state = PromiseState::PendingWithContinuation(Box::new(k));
        }
    }
}
