//! The connection context: one client session against one daemon.
//!
//! A [`Context`] multiplexes request/reply commands, server-pushed
//! events, and stream data over a single framed transport. All requests
//! are asynchronous: submission returns an [`Operation`] handle and the
//! outcome arrives through a completion callback on the session's
//! driver task.
//!
//! Connecting walks the session through `Connecting` → `Authorizing` →
//! `SettingName` → `Ready`; observers follow along via
//! [`Context::set_state_callback`]. `Failed` and `Terminated` are
//! terminal: every owned stream is forced to a matching terminal state,
//! pending requests complete unsuccessfully, and the transport is
//! released before the state callback fires.

pub mod subscribe;

mod driver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::callbacks::{CallbackCell, NotifyQueue};
use crate::cookie::AuthCookie;
use crate::error::Code;
use crate::memblock::MemblockStat;
use crate::messages::{write_message, Command};
use crate::operation::{Operation, OperationInner};
use crate::pdispatch::{Pdispatch, ReplyEvent, ReplyHandler, DEFAULT_REPLY_TIMEOUT};
use crate::pstream::{Frame, SendQueue};
use crate::server::ServerAddr;
use crate::stream::{Direction, StreamInner};
use crate::tagstruct::{TagReader, TagWriter};

use self::subscribe::{EventOperation, Facility, InterestMaskSet};

/// The state of a connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The context has not been connected yet.
    Unconnected,
    /// The transport is being established.
    Connecting,
    /// The client is authenticating itself to the daemon.
    Authorizing,
    /// The client is passing its display name to the daemon.
    SettingName,
    /// The session is established and accepts operations.
    Ready,
    /// The connection failed or was cut; terminal.
    Failed,
    /// The connection was closed deliberately; terminal.
    Terminated,
}

impl State {
    /// True for every state of a live connection attempt or session.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            State::Connecting | State::Authorizing | State::SettingName | State::Ready
        )
    }

    /// True once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Failed | State::Terminated)
    }
}

type StateCallback = Box<dyn FnMut(State) + Send>;
type SubscribeCallback = Box<dyn FnMut(Facility, EventOperation, u32) + Send>;
pub(crate) type AckCallback = Box<dyn FnOnce(bool) + Send>;

/// Live transport handles; present from `connect` until a terminal
/// transition nulls them.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) sendq: SendQueue,
    pub(crate) dispatch: Arc<Pdispatch>,
}

struct DrainWaiter {
    op: Arc<OperationInner>,
    cb: Box<dyn FnOnce() + Send>,
}

struct Core {
    state: State,
    error: Code,
    server_version: Option<u32>,
    link: Option<Link>,
    playback: HashMap<u32, Weak<StreamInner>>,
    record: HashMap<u32, Weak<StreamInner>>,
    streams: Vec<(u64, Weak<StreamInner>)>,
    drains: Vec<DrainWaiter>,
}

pub(crate) struct ContextInner {
    name: String,
    ctag: AtomicU32,
    next_stream_id: AtomicU64,
    stat: MemblockStat,
    core: Mutex<Core>,
    state_cb: CallbackCell<StateCallback>,
    state_notify: NotifyQueue<State>,
    subscribe_cb: CallbackCell<SubscribeCallback>,
}

/// A client session against one Cadenza daemon.
///
/// The handle is cheap to clone; clones share one session. A live
/// connection is owned jointly by the handles and by the session's
/// driver task, so call [`Context::disconnect`] when the sound support
/// is no longer needed rather than relying on the last drop.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a context in [`State::Unconnected`].
    ///
    /// `name` is the display name shown by the daemon for this client;
    /// it must be non-empty. No I/O happens until [`Context::connect`].
    pub fn new(name: impl Into<String>) -> Result<Context, Code> {
        let name = name.into();
        if name.is_empty() {
            return Err(Code::Invalid);
        }
        Ok(Context {
            inner: Arc::new(ContextInner {
                name,
                ctag: AtomicU32::new(0),
                next_stream_id: AtomicU64::new(0),
                stat: MemblockStat::new(),
                core: Mutex::new(Core {
                    state: State::Unconnected,
                    error: Code::Ok,
                    server_version: None,
                    link: None,
                    playback: HashMap::new(),
                    record: HashMap::new(),
                    streams: Vec::new(),
                    drains: Vec::new(),
                }),
                state_cb: CallbackCell::new(),
                state_notify: NotifyQueue::new(),
                subscribe_cb: CallbackCell::new(),
            }),
        })
    }

    /// The display name passed at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// The error of the most recent failure, [`Code::Ok`] if none.
    pub fn errno(&self) -> Code {
        self.inner.core.lock().error
    }

    /// The protocol revision negotiated with the server; `None` until
    /// authentication completed.
    pub fn server_protocol_version(&self) -> Option<u32> {
        self.inner.core.lock().server_version
    }

    /// The shared memory-block accounting counters for this session.
    pub fn memblock_stat(&self) -> MemblockStat {
        self.inner.stat.clone()
    }

    /// Installs the state observer, replacing any previous one. The
    /// callback runs synchronously inside the transition that triggered
    /// it, on whichever task drove the transition.
    pub fn set_state_callback(&self, cb: impl FnMut(State) + Send + 'static) {
        self.inner.state_cb.set(Some(Box::new(cb)));
    }

    pub fn clear_state_callback(&self) {
        self.inner.state_cb.set(None);
    }

    /// Installs the observer for server change notifications requested
    /// via [`Context::subscribe`].
    pub fn set_subscribe_callback(
        &self,
        cb: impl FnMut(Facility, EventOperation, u32) + Send + 'static,
    ) {
        self.inner.subscribe_cb.set(Some(Box::new(cb)));
    }

    pub fn clear_subscribe_callback(&self) {
        self.inner.subscribe_cb.set(None);
    }

    /// Starts connecting to a daemon. Valid only in
    /// [`State::Unconnected`].
    ///
    /// `server` falls back to `$CADENZA_SERVER`, then to the default
    /// per-user socket. A leading `/` selects a UNIX socket; anything
    /// else is `host[:port]`. The authentication cookie is loaded
    /// before any socket is opened; progress and the final verdict are
    /// reported through the state callback.
    ///
    /// Must be called from within a Tokio runtime: the session's driver
    /// task is spawned here.
    pub fn connect(&self, server: Option<&str>) -> Result<(), Code> {
        if self.inner.state() != State::Unconnected {
            return Err(Code::BadState);
        }

        let addr = match ServerAddr::resolve(server) {
            Ok(addr) => addr,
            Err(err) => {
                warn!(%err, "invalid server address");
                self.inner.fail(Code::InvalidServer);
                return Err(Code::InvalidServer);
            }
        };
        let cookie = match AuthCookie::load() {
            Ok(cookie) => cookie,
            Err(err) => {
                warn!(%err, "authentication cookie unavailable");
                self.inner.fail(Code::AuthKey);
                return Err(Code::AuthKey);
            }
        };

        let (sendq, rx) = SendQueue::new();
        let dispatch = Arc::new(Pdispatch::new());
        {
            let mut core = self.inner.core.lock();
            if core.state != State::Unconnected {
                return Err(Code::BadState);
            }
            core.link = Some(Link {
                sendq,
                dispatch,
            });
        }

        self.inner.set_state(State::Connecting);
        tokio::spawn(driver::run(self.inner.clone(), addr, cookie, rx));
        Ok(())
    }

    /// Closes the session immediately, from any state. All pending
    /// operations are signalled in terminal form and every stream is
    /// forced to [`StreamState::Terminated`](crate::StreamState).
    pub fn disconnect(&self) {
        self.inner.set_state(State::Terminated);
    }

    /// True while the framer's send queue or the pending-reply set has
    /// outstanding work. Always false outside [`State::Ready`].
    pub fn is_pending(&self) -> bool {
        let core = self.inner.core.lock();
        core.state == State::Ready
            && core
                .link
                .as_ref()
                .map_or(false, |l| l.sendq.depth() > 0 || l.dispatch.pending() > 0)
    }

    /// Notifies `cb` once the send queue and the pending-reply set are
    /// both empty. Returns `None` when there is nothing to wait for
    /// (including outside [`State::Ready`]); the callback then never
    /// runs.
    pub fn drain(&self, cb: impl FnOnce() + Send + 'static) -> Option<Operation> {
        let mut core = self.inner.core.lock();
        if core.state != State::Ready {
            return None;
        }
        let link = core.link.as_ref()?;
        if link.sendq.depth() == 0 && link.dispatch.pending() == 0 {
            return None;
        }
        let (op, op_inner) = Operation::start();
        core.drains.push(DrainWaiter {
            op: op_inner,
            cb: Box::new(cb),
        });
        Some(op)
    }

    /// Asks the daemon to shut down. The completion callback reports
    /// whether the server acknowledged before going away.
    pub fn exit_daemon(
        &self,
        cb: impl FnOnce(bool) + Send + 'static,
    ) -> Result<Operation, Code> {
        self.inner.simple_ack(Command::Exit, |_| {}, Box::new(cb))
    }

    /// Declares interest in change notifications for the given
    /// facilities; events arrive at the subscribe callback.
    pub fn subscribe(
        &self,
        mask: InterestMaskSet,
        cb: impl FnOnce(bool) + Send + 'static,
    ) -> Result<Operation, Code> {
        self.inner
            .simple_ack(Command::Subscribe, move |w| {
                w.put_u32(mask.bits());
            }, Box::new(cb))
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl ContextInner {
    pub(crate) fn state(&self) -> State {
        self.core.lock().state
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn stat(&self) -> &MemblockStat {
        &self.stat
    }

    pub(crate) fn link(&self) -> Option<Link> {
        self.core.lock().link.clone()
    }

    pub(crate) fn set_server_version(&self, version: u32) {
        self.core.lock().server_version = Some(version);
    }

    /// Central transition primitive. Terminal transitions sweep every
    /// collaborator before the state callback fires, exactly once: child
    /// streams first (from a snapshot, since a stream callback may
    /// unlink its own or a sibling's entry), then the pending-reply set,
    /// then the transport link.
    pub(crate) fn set_state(self: &Arc<Self>, new_state: State) {
        let teardown = {
            let mut core = self.core.lock();
            if core.state == new_state || core.state.is_terminal() {
                return;
            }
            debug!(from = ?core.state, to = ?new_state, "context state change");
            core.state = new_state;
            if new_state.is_terminal() {
                core.playback.clear();
                core.record.clear();
                Some((
                    core.link.take(),
                    std::mem::take(&mut core.streams),
                    std::mem::take(&mut core.drains),
                ))
            } else {
                None
            }
        };

        if let Some((link, streams, drains)) = teardown {
            for (_, weak) in streams {
                if let Some(stream) = weak.upgrade() {
                    stream.force_terminal(new_state);
                }
            }
            if let Some(link) = link {
                for handler in link.dispatch.abort_all() {
                    handler(ReplyEvent::Aborted);
                }
                // Dropping the link closes the driver's frame queue and
                // with it the socket.
            }
            for waiter in drains {
                waiter.op.cancel();
            }
        }

        // A callback may itself transition the context (e.g. call
        // disconnect); the queue delivers such nested transitions in
        // order once the running callback returns.
        if self.state_notify.push(new_state) {
            self.state_notify
                .drain(|state| self.state_cb.invoke(|cb| cb(state)));
        }
    }

    /// Records `code` and enters [`State::Failed`].
    pub(crate) fn fail(self: &Arc<Self>, code: Code) {
        {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                return;
            }
            core.error = code;
        }
        self.set_state(State::Failed);
    }

    pub(crate) fn set_error(&self, code: Code) {
        let mut core = self.core.lock();
        if !core.state.is_terminal() {
            core.error = code;
        }
    }

    /// Decodes a non-`REPLY` command delivered to a pending request.
    ///
    /// `ERROR` bodies yield their wire code; a synthesized `TIMEOUT`
    /// yields [`Code::Timeout`]. Anything else fails the context with
    /// [`Code::Protocol`] and returns `None`. With `fatal` set the
    /// decoded code also fails the context, as during the handshake.
    pub(crate) fn handle_error(
        self: &Arc<Self>,
        command: Command,
        body: &mut TagReader,
        fatal: bool,
    ) -> Option<Code> {
        let code = match command {
            Command::Error => match body.get_u32() {
                Ok(raw) if body.eof() => Code::from_wire(raw),
                _ => {
                    self.fail(Code::Protocol);
                    return None;
                }
            },
            Command::Timeout => Code::Timeout,
            _ => {
                warn!(?command, "unexpected command in reply position");
                self.fail(Code::Protocol);
                return None;
            }
        };
        self.set_error(code);
        if fatal {
            self.fail(code);
        }
        Some(code)
    }

    /// Builds and enqueues one tagged request, registering `handler`
    /// for its reply under the default timeout. Returns the fresh tag.
    pub(crate) fn submit_request(
        self: &Arc<Self>,
        command: Command,
        body: impl FnOnce(&mut TagWriter),
        handler: ReplyHandler,
    ) -> Result<u32, Code> {
        let link = self.link().ok_or(Code::BadState)?;
        let tag = self.ctag.fetch_add(1, Ordering::Relaxed);
        let packet = write_message(command, tag, body);
        link.dispatch.register(tag, DEFAULT_REPLY_TIMEOUT, handler);
        debug!(?command, tag, "sending request");
        if let Err(code) = link.sendq.submit(Frame::Packet(packet)) {
            // The driver is gone; don't leave the handler stranded.
            if let Some(handler) = link.dispatch.take(tag) {
                handler(ReplyEvent::Aborted);
            }
            return Err(code);
        }
        Ok(tag)
    }

    /// The submission pattern for commands that only acknowledge:
    /// request out, one reply expected, completion surfaced as a
    /// success flag.
    pub(crate) fn simple_ack(
        self: &Arc<Self>,
        command: Command,
        body: impl FnOnce(&mut TagWriter),
        cb: AckCallback,
    ) -> Result<Operation, Code> {
        if self.state() != State::Ready {
            return Err(Code::BadState);
        }
        let (op, op_inner) = Operation::start();
        let ctx = self.clone();
        let handler: ReplyHandler =
            Box::new(move |event| ctx.complete_simple_ack(op_inner, cb, event));
        self.submit_request(command, body, handler)?;
        Ok(op)
    }

    fn complete_simple_ack(
        self: &Arc<Self>,
        op: Arc<OperationInner>,
        cb: AckCallback,
        event: ReplyEvent,
    ) {
        match event {
            ReplyEvent::Message {
                command: Command::Reply,
                body,
            } => {
                if body.eof() {
                    cb(true);
                } else {
                    // Trailing bytes mean we no longer agree on framing.
                    self.fail(Code::Protocol);
                }
                op.done();
            }
            ReplyEvent::Message { command, mut body } => {
                if self.handle_error(command, &mut body, false).is_some() {
                    cb(false);
                }
                op.done();
            }
            ReplyEvent::Timeout => {
                let mut body = TagReader::new(Bytes::new());
                self.handle_error(Command::Timeout, &mut body, false);
                cb(false);
                op.done();
            }
            ReplyEvent::Aborted => {
                cb(false);
                op.cancel();
            }
        }
    }

    /// Fires due drain waiters. Called whenever either queue reports an
    /// empty transition.
    pub(crate) fn check_drain(self: &Arc<Self>) {
        let due = {
            let mut core = self.core.lock();
            match core.link.as_ref() {
                Some(link) if link.sendq.depth() == 0 && link.dispatch.pending() == 0 => {
                    std::mem::take(&mut core.drains)
                }
                _ => Vec::new(),
            }
        };
        for waiter in due {
            (waiter.cb)();
            waiter.op.done();
        }
    }

    // Stream bookkeeping. The channel maps hold non-owning references;
    // the streams list drives terminal fan-out.

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_stream(&self, id: u64, stream: Weak<StreamInner>) {
        self.core.lock().streams.push((id, stream));
    }

    pub(crate) fn bind_channel(
        &self,
        direction: Direction,
        channel: u32,
        stream: Weak<StreamInner>,
    ) {
        let mut core = self.core.lock();
        let map = match direction {
            Direction::Playback => &mut core.playback,
            Direction::Record => &mut core.record,
        };
        map.insert(channel, stream);
    }

    pub(crate) fn unbind_channel(&self, direction: Direction, channel: u32) {
        let mut core = self.core.lock();
        let map = match direction {
            Direction::Playback => &mut core.playback,
            Direction::Record => &mut core.record,
        };
        map.remove(&channel);
    }

    /// Called from a stream's drop; removes list and map entries that
    /// point at the vanished stream. A live rebind of the same channel
    /// id is left alone.
    pub(crate) fn forget_stream(&self, id: u64, direction: Direction, channel: Option<u32>) {
        let mut core = self.core.lock();
        core.streams.retain(|(sid, _)| *sid != id);
        if let Some(channel) = channel {
            let map = match direction {
                Direction::Playback => &mut core.playback,
                Direction::Record => &mut core.record,
            };
            if map.get(&channel).is_some_and(|w| w.upgrade().is_none()) {
                map.remove(&channel);
            }
        }
    }

    pub(crate) fn playback_stream(&self, channel: u32) -> Option<Arc<StreamInner>> {
        self.core.lock().playback.get(&channel).and_then(Weak::upgrade)
    }

    pub(crate) fn record_stream(&self, channel: u32) -> Option<Arc<StreamInner>> {
        self.core.lock().record.get(&channel).and_then(Weak::upgrade)
    }

    pub(crate) fn take_killed_stream(
        &self,
        direction: Direction,
        channel: u32,
    ) -> Option<Arc<StreamInner>> {
        let mut core = self.core.lock();
        let map = match direction {
            Direction::Playback => &mut core.playback,
            Direction::Record => &mut core.record,
        };
        map.remove(&channel).and_then(|w| w.upgrade())
    }

    pub(crate) fn fire_subscribe_event(
        &self,
        facility: Facility,
        operation: EventOperation,
        index: u32,
    ) {
        self.subscribe_cb.invoke(|cb| cb(facility, operation, index));
    }
}
