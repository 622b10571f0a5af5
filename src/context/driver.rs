//! The per-session driver task.
//!
//! Owns the socket for the lifetime of one connection attempt:
//! establishes the transport, runs the authentication handshake, then
//! pumps outgoing frames, incoming packets and memory blocks, and reply
//! deadlines until the session ends.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, error, trace, warn};

use crate::cookie::AuthCookie;
use crate::error::Code;
use crate::memblock::{Chunk, Memblock};
use crate::messages::{read_header, Command, ServerEvent, PROTOCOL_VERSION};
use crate::pdispatch::ReplyEvent;
use crate::pstream::{Frame, FrameCodec, FrameError};
use crate::server::ServerAddr;
use crate::stream::Direction;
use crate::tagstruct::TagReader;

use super::{ContextInner, Link, State};
use super::subscribe::{EventOperation, Facility};

pub(super) async fn run(
    ctx: Arc<ContextInner>,
    addr: ServerAddr,
    cookie: AuthCookie,
    mut rx: UnboundedReceiver<Frame>,
) {
    let Some(link) = ctx.link() else { return };

    let medium = match addr.open().await {
        Ok(medium) => medium,
        Err(code) => {
            ctx.fail(code);
            return;
        }
    };
    // The user may have disconnected while the socket was opening.
    if ctx.state() != State::Connecting {
        return;
    }

    let (mut sink, mut source) = Framed::new(medium, FrameCodec::new()).split();
    ctx.begin_auth(&cookie);

    loop {
        let deadline = link.dispatch.next_deadline();
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        error!(%err, "transport write failed");
                        ctx.fail(Code::ConnectionTerminated);
                        return;
                    }
                    if link.sendq.complete_one() {
                        ctx.check_drain();
                    }
                }
                // The context dropped the link: terminal teardown.
                None => return,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Frame::Packet(data))) => ctx.route_packet(data, &link),
                Some(Ok(Frame::Memblock { channel, delta, data })) => {
                    ctx.route_memblock(channel, delta, data);
                }
                Some(Err(FrameError::Io(err))) => {
                    error!(%err, "transport read failed");
                    ctx.fail(Code::ConnectionTerminated);
                    return;
                }
                Some(Err(err)) => {
                    error!(%err, "framing violation");
                    ctx.fail(Code::Protocol);
                    return;
                }
                None => {
                    debug!("server closed the connection");
                    ctx.fail(Code::ConnectionTerminated);
                    return;
                }
            },
            _ = deadline_elapsed(deadline) => {
                let expired = link.dispatch.expire(Instant::now());
                if !expired.is_empty() {
                    warn!(count = expired.len(), "reply deadline expired");
                    for handler in expired {
                        handler(ReplyEvent::Timeout);
                    }
                    ctx.check_drain();
                }
            }
        }

        if ctx.state().is_terminal() {
            return;
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ContextInner {
    /// Sends `AUTH` and registers the first handshake continuation.
    fn begin_auth(self: &Arc<Self>, cookie: &AuthCookie) {
        debug_assert_eq!(self.state(), State::Connecting);
        let ctx = self.clone();
        let handler = Box::new(move |event| ctx.auth_complete(event));
        let payload = Bytes::copy_from_slice(cookie.as_bytes());
        if self
            .submit_request(Command::Auth, |w| {
                w.put_u32(PROTOCOL_VERSION);
                w.put_arbitrary(&payload);
            }, handler)
            .is_ok()
        {
            self.set_state(State::Authorizing);
        }
    }

    fn auth_complete(self: &Arc<Self>, event: ReplyEvent) {
        match event {
            ReplyEvent::Message {
                command: Command::Reply,
                mut body,
            } => {
                debug_assert_eq!(self.state(), State::Authorizing);
                let server_version = match body.get_u32() {
                    Ok(version) if body.eof() => version,
                    _ => {
                        self.fail(Code::Protocol);
                        return;
                    }
                };
                let negotiated = server_version.min(PROTOCOL_VERSION);
                debug!(server_version, negotiated, "authenticated");
                self.set_server_version(negotiated);
                self.begin_set_name();
            }
            ReplyEvent::Message { command, mut body } => {
                self.handle_error(command, &mut body, true);
            }
            ReplyEvent::Timeout => {
                let mut body = TagReader::new(Bytes::new());
                self.handle_error(Command::Timeout, &mut body, true);
            }
            ReplyEvent::Aborted => {}
        }
    }

    /// Sends `SET_NAME` and registers the final handshake continuation.
    fn begin_set_name(self: &Arc<Self>) {
        debug_assert_eq!(self.state(), State::Authorizing);
        let ctx = self.clone();
        let handler = Box::new(move |event| ctx.set_name_complete(event));
        let name = self.name().to_string();
        if self
            .submit_request(Command::SetName, |w| {
                w.put_string(&name);
            }, handler)
            .is_ok()
        {
            self.set_state(State::SettingName);
        }
    }

    fn set_name_complete(self: &Arc<Self>, event: ReplyEvent) {
        match event {
            ReplyEvent::Message {
                command: Command::Reply,
                body,
            } => {
                debug_assert_eq!(self.state(), State::SettingName);
                if !body.eof() {
                    self.fail(Code::Protocol);
                    return;
                }
                self.set_state(State::Ready);
            }
            ReplyEvent::Message { command, mut body } => {
                self.handle_error(command, &mut body, true);
            }
            ReplyEvent::Timeout => {
                let mut body = TagReader::new(Bytes::new());
                self.handle_error(Command::Timeout, &mut body, true);
            }
            ReplyEvent::Aborted => {}
        }
    }

    /// Routes one control packet: replies to their registered handler,
    /// everything else through the server-event table.
    pub(super) fn route_packet(self: &Arc<Self>, data: Bytes, link: &Link) {
        let mut reader = TagReader::new(data);
        let (command, tag) = match read_header(&mut reader) {
            Ok(Some(header)) => header,
            Ok(None) => {
                warn!("unknown command id from server");
                self.fail(Code::Protocol);
                return;
            }
            Err(err) => {
                warn!(%err, "malformed packet header");
                self.fail(Code::Protocol);
                return;
            }
        };
        trace!(?command, tag, "packet received");

        if command.is_reply() {
            match link.dispatch.take(tag) {
                Some(handler) => {
                    handler(ReplyEvent::Message {
                        command,
                        body: reader,
                    });
                    if link.dispatch.pending() == 0 {
                        self.check_drain();
                    }
                }
                None => {
                    warn!(tag, "reply for a tag with no pending request");
                    self.fail(Code::Protocol);
                }
            }
            return;
        }

        match ServerEvent::parse(command, &mut reader) {
            Ok(Some(event)) => self.route_event(event),
            Ok(None) => {
                warn!(?command, "client-bound command is not an event");
                self.fail(Code::Protocol);
            }
            Err(err) => {
                warn!(%err, ?command, "malformed event body");
                self.fail(Code::Protocol);
            }
        }
    }

    fn route_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Request { channel, bytes } => {
                match self.playback_stream(channel) {
                    Some(stream) => stream.add_requested(bytes as usize),
                    None => {
                        warn!(channel, "flow control for unknown playback stream");
                        self.fail(Code::Protocol);
                    }
                }
            }
            ServerEvent::PlaybackStreamKilled { channel } => {
                self.stream_killed(Direction::Playback, channel);
            }
            ServerEvent::RecordStreamKilled { channel } => {
                self.stream_killed(Direction::Record, channel);
            }
            ServerEvent::SubscribeEvent { bits, index } => {
                match (Facility::from_wire(bits), EventOperation::from_wire(bits)) {
                    (Some(facility), Some(operation)) => {
                        trace!(?facility, ?operation, index, "subscription event");
                        self.fire_subscribe_event(facility, operation, index);
                    }
                    _ => {
                        warn!(bits, "malformed subscription event");
                        self.fail(Code::Protocol);
                    }
                }
            }
        }
    }

    fn stream_killed(self: &Arc<Self>, direction: Direction, channel: u32) {
        match self.take_killed_stream(direction, channel) {
            Some(stream) => {
                warn!(?direction, channel, "server killed stream");
                self.set_error(Code::Killed);
                stream.killed();
            }
            None => {
                warn!(?direction, channel, "kill notification for unknown stream");
                self.fail(Code::Protocol);
            }
        }
    }

    /// Delivers a memory block to the record stream on `channel`, or
    /// drops it silently when no such stream exists.
    pub(super) fn route_memblock(self: &Arc<Self>, channel: u32, delta: u32, data: Bytes) {
        let Some(stream) = self.record_stream(channel) else {
            warn!(channel, len = data.len(), "memory block for unknown channel dropped");
            return;
        };
        let block = Memblock::new(data, self.stat());
        stream.deliver(Chunk::from_block(block), delta);
    }
}
