//! Handles onto in-flight asynchronous requests.

use std::sync::Arc;

use parking_lot::Mutex;

/// Lifecycle of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// The request is outstanding.
    Running,
    /// The request completed: reply, server error, or timeout.
    Done,
    /// The session died before a reply could arrive.
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct OperationInner {
    state: Mutex<OperationState>,
}

impl OperationInner {
    /// Moves to `Done`. Completion is one-way and one-time; later calls
    /// are ignored so a racing teardown can't double-fire.
    pub(crate) fn done(&self) {
        let mut state = self.state.lock();
        if *state == OperationState::Running {
            *state = OperationState::Done;
        }
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == OperationState::Running {
            *state = OperationState::Cancelled;
        }
    }

    pub(crate) fn state(&self) -> OperationState {
        *self.state.lock()
    }
}

/// A caller-visible reference to one outstanding request.
///
/// Cloning the handle shares the same underlying operation. There is no
/// way to cancel a single request; disconnecting the context cancels
/// everything still pending.
#[derive(Debug, Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    pub(crate) fn start() -> (Operation, Arc<OperationInner>) {
        let inner = Arc::new(OperationInner {
            state: Mutex::new(OperationState::Running),
        });
        (
            Operation {
                inner: inner.clone(),
            },
            inner,
        )
    }

    pub fn state(&self) -> OperationState {
        self.inner.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_one_way() {
        let (op, inner) = Operation::start();
        assert_eq!(op.state(), OperationState::Running);

        inner.done();
        assert_eq!(op.state(), OperationState::Done);

        inner.cancel();
        assert_eq!(op.state(), OperationState::Done);
    }

    #[test]
    fn cancel_sticks_before_done() {
        let (op, inner) = Operation::start();
        inner.cancel();
        inner.done();
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn clones_observe_the_same_operation() {
        let (op, inner) = Operation::start();
        let other = op.clone();
        inner.done();
        assert_eq!(other.state(), OperationState::Done);
    }
}
