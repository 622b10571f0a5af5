//! Observer-callback storage that stays safe under re-entry.
//!
//! User callbacks may call back into the object that fired them, up to
//! and including replacing or clearing the very callback that is
//! running. The slot is taken out before the call and restored after it
//! only if no `set` happened in between; the internal lock is never
//! held across user code.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Orders observer notifications under re-entry.
///
/// A callback cannot be re-entered (it is an `FnMut` behind a unique
/// borrow), so a transition triggered from inside an observer is queued
/// here and delivered by the enclosing drain once the outer call
/// returns. Exactly-once and ordering are preserved.
pub(crate) struct NotifyQueue<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T: Copy> Default for NotifyQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T: Copy> NotifyQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a notification. Returns false when an enclosing drain is
    /// already running and will deliver it.
    pub(crate) fn push(&self, value: T) -> bool {
        let mut queue = self.queue.lock();
        queue.push_back(value);
        queue.len() == 1
    }

    /// Delivers queued notifications in order until the queue empties.
    pub(crate) fn drain(&self, mut deliver: impl FnMut(T)) {
        loop {
            let Some(value) = self.queue.lock().front().copied() else {
                return;
            };
            deliver(value);
            self.queue.lock().pop_front();
        }
    }
}

struct Slot<F> {
    f: Option<F>,
    generation: u64,
}

pub(crate) struct CallbackCell<F> {
    slot: Mutex<Slot<F>>,
}

impl<F> Default for CallbackCell<F> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                f: None,
                generation: 0,
            }),
        }
    }
}

impl<F> CallbackCell<F> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, f: Option<F>) {
        let mut slot = self.slot.lock();
        slot.f = f;
        slot.generation += 1;
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.lock().f.is_some()
    }

    /// Runs the stored callback, if any, outside the lock.
    pub(crate) fn invoke(&self, call: impl FnOnce(&mut F)) {
        let (taken, generation) = {
            let mut slot = self.slot.lock();
            (slot.f.take(), slot.generation)
        };
        if let Some(mut f) = taken {
            call(&mut f);
            let mut slot = self.slot.lock();
            // A set() from inside the callback supersedes the running one.
            if slot.generation == generation {
                slot.f = Some(f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn invoke_runs_and_restores() {
        let cell: CallbackCell<Box<dyn FnMut() + Send>> = CallbackCell::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cell.set(Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));

        cell.invoke(|f| f());
        cell.invoke(|f| f());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(cell.is_set());
    }

    #[test]
    fn replacement_from_inside_the_callback_wins() {
        let cell: Arc<CallbackCell<Box<dyn FnMut(&mut Vec<&'static str>) + Send>>> =
            Arc::new(CallbackCell::new());

        let cell2 = cell.clone();
        cell.set(Some(Box::new(move |log: &mut Vec<&'static str>| {
            log.push("first");
            cell2.set(Some(Box::new(|log: &mut Vec<&'static str>| {
                log.push("second");
            })));
        })));

        let mut log = Vec::new();
        cell.invoke(|f| f(&mut log));
        cell.invoke(|f| f(&mut log));
        assert_eq!(log, vec!["first", "second"]);
    }

    #[test]
    fn clearing_from_inside_the_callback_sticks() {
        let cell: Arc<CallbackCell<Box<dyn FnMut() + Send>>> = Arc::new(CallbackCell::new());
        let cell2 = cell.clone();
        cell.set(Some(Box::new(move || {
            cell2.set(None);
        })));

        cell.invoke(|f| f());
        assert!(!cell.is_set());
    }

    #[test]
    fn invoke_on_empty_cell_is_a_no_op() {
        let cell: CallbackCell<Box<dyn FnMut() + Send>> = CallbackCell::new();
        cell.invoke(|f| f());
        assert!(!cell.is_set());
    }

    #[test]
    fn nested_notifications_deliver_in_order() {
        let queue = Arc::new(NotifyQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let q = queue.clone();
        let s = seen.clone();
        if queue.push(1u32) {
            queue.drain(|value| {
                s.lock().push(value);
                if value == 1 {
                    // A transition triggered from inside the observer.
                    assert!(!q.push(2));
                }
            });
        }

        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
