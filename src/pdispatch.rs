//! Reply dispatcher: matches incoming tagged replies to the callbacks
//! registered for their request tags, with a per-entry deadline.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::messages::Command;
use crate::tagstruct::TagReader;

/// Default deadline for any registered reply.
pub(crate) const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// What a registered handler is invoked with, exactly once.
pub(crate) enum ReplyEvent {
    /// A reply-class packet arrived for the tag; the reader is positioned
    /// at the body.
    Message { command: Command, body: TagReader },
    /// The deadline expired with no reply.
    Timeout,
    /// The session reached a terminal state before the reply arrived.
    Aborted,
}

pub(crate) type ReplyHandler = Box<dyn FnOnce(ReplyEvent) + Send>;

struct Entry {
    handler: ReplyHandler,
    deadline: Instant,
}

/// Pending-reply registry shared between the submitting side and the
/// driver task. Handlers are always invoked outside the internal lock.
#[derive(Default)]
pub(crate) struct Pdispatch {
    entries: Mutex<HashMap<u32, Entry>>,
}

impl Pdispatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, tag: u32, timeout: Duration, handler: ReplyHandler) {
        let entry = Entry {
            handler,
            deadline: Instant::now() + timeout,
        };
        let previous = self.entries.lock().insert(tag, entry);
        debug_assert!(previous.is_none(), "reply tag registered twice");
    }

    /// Removes the handler for `tag`, if any.
    pub(crate) fn take(&self, tag: u32) -> Option<ReplyHandler> {
        self.entries.lock().remove(&tag).map(|e| e.handler)
    }

    /// Removes every entry whose deadline has passed.
    pub(crate) fn expire(&self, now: Instant) -> Vec<ReplyHandler> {
        let mut entries = self.entries.lock();
        let due: Vec<u32> = entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        due.into_iter()
            .filter_map(|tag| entries.remove(&tag).map(|e| e.handler))
            .collect()
    }

    /// Drains every pending entry for terminal teardown.
    pub(crate) fn abort_all(&self) -> Vec<ReplyHandler> {
        let mut entries = self.entries.lock();
        entries.drain().map(|(_, e)| e.handler).collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.lock().values().map(|e| e.deadline).min()
    }
}
