//! Playback and record streams: the per-channel children of a
//! [`Context`].
//!
//! A stream is created against a ready context, negotiates a
//! server-assigned channel id, and then carries audio one way: playback
//! streams push blocks as the server requests bytes, record streams
//! receive blocks through a read callback. The context forces every
//! stream into a matching terminal state when the session itself fails
//! or terminates.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::callbacks::{CallbackCell, NotifyQueue};
use crate::context::{Context, ContextInner, State};
use crate::error::Code;
use crate::memblock::{Chunk, Memblock};
use crate::messages::Command;
use crate::pdispatch::{ReplyEvent, ReplyHandler};
use crate::pstream::Frame;

/// Transfer direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server: the stream feeds a sink.
    Playback,
    /// Server to client: the stream taps a source.
    Record,
}

/// The state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet announced to the server.
    Unconnected,
    /// The create request is in flight.
    Creating,
    /// The channel is established and carries data.
    Ready,
    /// The stream died with the session, was killed by the server, or
    /// failed to establish; terminal.
    Failed,
    /// The stream was shut down deliberately; terminal.
    Terminated,
}

impl StreamState {
    pub fn is_good(self) -> bool {
        matches!(self, StreamState::Creating | StreamState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Failed | StreamState::Terminated)
    }
}

type StreamStateCallback = Box<dyn FnMut(StreamState) + Send>;
type ReadCallback = Box<dyn FnMut(&Chunk, u32) + Send>;
type WriteCallback = Box<dyn FnMut(usize) + Send>;

struct Guts {
    state: StreamState,
    channel: Option<u32>,
    requested: usize,
}

pub(crate) struct StreamInner {
    context: Arc<ContextInner>,
    id: u64,
    name: String,
    direction: Direction,
    guts: Mutex<Guts>,
    state_cb: CallbackCell<StreamStateCallback>,
    state_notify: NotifyQueue<StreamState>,
    read_cb: CallbackCell<ReadCallback>,
    write_cb: CallbackCell<WriteCallback>,
}

/// One playback or record stream owned by a [`Context`].
///
/// The handle is cheap to clone; dropping the last clone detaches the
/// stream from its context without telling the server. Call
/// [`Stream::disconnect`] for an orderly teardown.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Creates an unconnected stream bound to `context`. `name` is the
    /// stream's display name and must be non-empty.
    pub fn new(
        context: &Context,
        name: impl Into<String>,
        direction: Direction,
    ) -> Result<Stream, Code> {
        let name = name.into();
        if name.is_empty() {
            return Err(Code::Invalid);
        }
        let context = context.inner().clone();
        let inner = Arc::new(StreamInner {
            id: context.next_stream_id(),
            name,
            direction,
            guts: Mutex::new(Guts {
                state: StreamState::Unconnected,
                channel: None,
                requested: 0,
            }),
            state_cb: CallbackCell::new(),
            state_notify: NotifyQueue::new(),
            read_cb: CallbackCell::new(),
            write_cb: CallbackCell::new(),
            context,
        });
        inner
            .context
            .register_stream(inner.id, Arc::downgrade(&inner));
        Ok(Stream { inner })
    }

    pub fn state(&self) -> StreamState {
        self.inner.guts.lock().state
    }

    /// The server-assigned channel id, once the stream is established.
    pub fn channel(&self) -> Option<u32> {
        self.inner.guts.lock().channel
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bytes the server currently wants from a playback stream.
    pub fn requested_bytes(&self) -> usize {
        self.inner.guts.lock().requested
    }

    /// Installs the state observer, replacing any previous one.
    pub fn set_state_callback(&self, cb: impl FnMut(StreamState) + Send + 'static) {
        self.inner.state_cb.set(Some(Box::new(cb)));
    }

    /// Installs the record read callback. The chunk reference is only
    /// valid for the duration of the call; copy out whatever must
    /// outlive it. The second argument is the block's sequence delta.
    pub fn set_read_callback(&self, cb: impl FnMut(&Chunk, u32) + Send + 'static) {
        self.inner.read_cb.set(Some(Box::new(cb)));
    }

    /// Installs the playback flow-control callback, invoked with the
    /// byte count of every server `REQUEST`.
    pub fn set_write_callback(&self, cb: impl FnMut(usize) + Send + 'static) {
        self.inner.write_cb.set(Some(Box::new(cb)));
    }

    /// Announces the stream to the server. Valid once, on an
    /// unconnected stream whose context is [`State::Ready`].
    pub fn connect(&self) -> Result<(), Code> {
        {
            let guts = self.inner.guts.lock();
            if guts.state != StreamState::Unconnected {
                return Err(Code::BadState);
            }
        }
        if self.inner.context.state() != State::Ready {
            return Err(Code::BadState);
        }

        let command = match self.inner.direction {
            Direction::Playback => Command::CreatePlaybackStream,
            Direction::Record => Command::CreateRecordStream,
        };
        let ctx = self.inner.context.clone();
        let weak = Arc::downgrade(&self.inner);
        let direction = self.inner.direction;
        let handler: ReplyHandler =
            Box::new(move |event| StreamInner::create_complete(&ctx, weak, direction, event));
        let name = self.inner.name.clone();

        self.inner.set_state(StreamState::Creating);
        if let Err(code) = self.inner.context.submit_request(
            command,
            |w| {
                w.put_string(&name);
            },
            handler,
        ) {
            self.inner.set_state(StreamState::Failed);
            return Err(code);
        }
        Ok(())
    }

    /// Pushes playback data for the server to render. Debits the
    /// requested-bytes budget announced through the write callback.
    pub fn write(&self, data: &[u8]) -> Result<(), Code> {
        if self.inner.direction != Direction::Playback {
            return Err(Code::BadState);
        }
        let channel = {
            let mut guts = self.inner.guts.lock();
            if guts.state != StreamState::Ready {
                return Err(Code::BadState);
            }
            let channel = guts.channel.ok_or(Code::BadState)?;
            guts.requested = guts.requested.saturating_sub(data.len());
            channel
        };
        let link = self.inner.context.link().ok_or(Code::BadState)?;

        // Charge the traffic against the shared accounting before it
        // leaves through the framer.
        let block = Memblock::new(Bytes::copy_from_slice(data), self.inner.context.stat());
        link.sendq.submit(Frame::Memblock {
            channel,
            delta: 0,
            data: block.bytes(),
        })
    }

    /// Orderly teardown: asks the server to delete the channel, then
    /// moves to [`StreamState::Terminated`]. A stream that never made
    /// it to the server terminates immediately.
    pub fn disconnect(&self) -> Result<(), Code> {
        let (channel, established) = {
            let guts = self.inner.guts.lock();
            if guts.state.is_terminal() {
                return Err(Code::BadState);
            }
            (guts.channel, guts.state == StreamState::Ready)
        };

        let (Some(channel), true) = (channel, established) else {
            self.inner.set_state(StreamState::Terminated);
            return Ok(());
        };

        let command = match self.inner.direction {
            Direction::Playback => Command::DeletePlaybackStream,
            Direction::Record => Command::DeleteRecordStream,
        };
        let weak = Arc::downgrade(&self.inner);
        let ctx = self.inner.context.clone();
        let handler: ReplyHandler = Box::new(move |event| {
            let Some(stream) = weak.upgrade() else { return };
            match event {
                ReplyEvent::Message {
                    command: Command::Reply,
                    body,
                } => {
                    if body.eof() {
                        stream.set_state(StreamState::Terminated);
                    } else {
                        // Trailing bytes mean we no longer agree on
                        // framing; terminal fan-out sweeps the stream.
                        ctx.fail(Code::Protocol);
                    }
                }
                ReplyEvent::Message { command, mut body } => {
                    ctx.handle_error(command, &mut body, false);
                    stream.set_state(StreamState::Failed);
                }
                ReplyEvent::Timeout => {
                    ctx.set_error(Code::Timeout);
                    stream.set_state(StreamState::Failed);
                }
                ReplyEvent::Aborted => {}
            }
        });
        self.inner.context.submit_request(
            command,
            |w| {
                w.put_u32(channel);
            },
            handler,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guts = self.inner.guts.lock();
        f.debug_struct("Stream")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("state", &guts.state)
            .field("channel", &guts.channel)
            .finish_non_exhaustive()
    }
}

impl StreamInner {
    fn set_state(&self, new_state: StreamState) {
        let unbind = {
            let mut guts = self.guts.lock();
            if guts.state == new_state || guts.state.is_terminal() {
                return;
            }
            debug!(
                stream = self.name.as_str(),
                from = ?guts.state,
                to = ?new_state,
                "stream state change"
            );
            guts.state = new_state;
            if new_state.is_terminal() {
                guts.channel
            } else {
                None
            }
        };
        if let Some(channel) = unbind {
            self.context.unbind_channel(self.direction, channel);
        }
        if self.state_notify.push(new_state) {
            self.state_notify
                .drain(|state| self.state_cb.invoke(|cb| cb(state)));
        }
    }

    /// Continuation of the create request.
    fn create_complete(
        ctx: &Arc<ContextInner>,
        weak: std::sync::Weak<StreamInner>,
        direction: Direction,
        event: ReplyEvent,
    ) {
        let Some(stream) = weak.upgrade() else {
            // The handle vanished while the request was in flight; if
            // the server allocated a channel anyway, give it back.
            if let ReplyEvent::Message {
                command: Command::Reply,
                mut body,
            } = event
            {
                if let Ok(channel) = body.get_u32() {
                    StreamInner::release_orphan_channel(ctx, channel, direction);
                }
            }
            return;
        };

        match event {
            ReplyEvent::Message {
                command: Command::Reply,
                mut body,
            } => {
                let channel = body.get_u32();
                let requested = match stream.direction {
                    Direction::Playback => body.get_u32().map(|v| v as usize),
                    Direction::Record => Ok(0),
                };
                let (Ok(channel), Ok(requested), true) = (channel, requested, body.eof()) else {
                    ctx.fail(Code::Protocol);
                    return;
                };

                {
                    let mut guts = stream.guts.lock();
                    guts.channel = Some(channel);
                    guts.requested = requested;
                }
                ctx.bind_channel(stream.direction, channel, weak);
                debug!(
                    stream = stream.name.as_str(),
                    channel, requested, "stream established"
                );
                stream.set_state(StreamState::Ready);
            }
            ReplyEvent::Message { command, mut body } => {
                ctx.handle_error(command, &mut body, false);
                stream.set_state(StreamState::Failed);
            }
            ReplyEvent::Timeout => {
                ctx.set_error(Code::Timeout);
                stream.set_state(StreamState::Failed);
            }
            // Terminal fan-out has already forced the stream's state.
            ReplyEvent::Aborted => {}
        }
    }

    fn release_orphan_channel(ctx: &Arc<ContextInner>, channel: u32, direction: Direction) {
        trace!(channel, ?direction, "releasing channel for a dropped stream handle");
        // Channel ids are only unique per direction, so the delete must
        // go to the map the server allocated from. A handler must still
        // consume the ack to keep the tag space clean.
        let command = match direction {
            Direction::Playback => Command::DeletePlaybackStream,
            Direction::Record => Command::DeleteRecordStream,
        };
        let _ = ctx.submit_request(
            command,
            |w| {
                w.put_u32(channel);
            },
            Box::new(|_| {}),
        );
    }

    /// Flow control from the server: grow the budget, tell the writer.
    pub(crate) fn add_requested(&self, bytes: usize) {
        {
            let mut guts = self.guts.lock();
            guts.requested = guts.requested.saturating_add(bytes);
        }
        self.write_cb.invoke(|cb| cb(bytes));
    }

    /// Hands an incoming block to the read callback, if one is set.
    /// The block is released when this returns.
    pub(crate) fn deliver(&self, chunk: Chunk, delta: u32) {
        if !self.read_cb.is_set() {
            trace!(
                stream = self.name.as_str(),
                len = chunk.len(),
                "no read callback, block dropped"
            );
            return;
        }
        self.read_cb.invoke(|cb| cb(&chunk, delta));
    }

    pub(crate) fn killed(&self) {
        self.set_state(StreamState::Failed);
    }

    /// Terminal fan-out from the context; maps the context's terminal
    /// state onto the stream.
    pub(crate) fn force_terminal(&self, context_state: State) {
        let mapped = match context_state {
            State::Terminated => StreamState::Terminated,
            _ => StreamState::Failed,
        };
        self.set_state(mapped);
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let channel = self.guts.get_mut().channel;
        self.context.forget_stream(self.id, self.direction, channel);
    }
}
