//! In-process daemon double for integration tests.
//!
//! Speaks the server side of the wire protocol over a UNIX socket: one
//! accepted connection, a scripted handshake, then explicit
//! expect/reply/event calls so a test controls every server behavior,
//! including the misbehaving ones.

use std::io;
use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

use crate::cookie::COOKIE_LENGTH;
use crate::error::Code;
use crate::messages::{read_header, write_message, Command, EVENT_TAG, PROTOCOL_VERSION};
use crate::pstream::{Frame, FrameCodec, FrameError};
use crate::tagstruct::{TagError, TagReader, TagWriter};

/// Failure inside the daemon double itself.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("client closed the connection")]
    Closed,
    #[error("received {0} where the script expected something else")]
    Unexpected(&'static str),
}

/// How the double answers the `AUTH` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Accept,
    Reject(Code),
}

/// One decoded control packet from the client.
pub struct IncomingMessage {
    pub command: Command,
    pub tag: u32,
    pub body: TagReader,
}

/// Anything the client can send.
pub enum Incoming {
    Message(IncomingMessage),
    Memblock { channel: u32, delta: u32, data: Bytes },
}

/// The server end of one client connection.
pub struct ServerConn {
    framed: Framed<UnixStream, FrameCodec>,
}

impl ServerConn {
    /// Binds `path` and waits for exactly one client.
    pub async fn listen(path: &Path) -> Result<ServerConn, HarnessError> {
        let listener = UnixListener::bind(path)?;
        Self::accept(&listener).await
    }

    pub async fn accept(listener: &UnixListener) -> Result<ServerConn, HarnessError> {
        let (stream, _) = listener.accept().await?;
        Ok(ServerConn {
            framed: Framed::new(stream, FrameCodec::new()),
        })
    }

    /// Receives the next frame of either kind.
    pub async fn recv(&mut self) -> Result<Incoming, HarnessError> {
        match self.framed.next().await {
            Some(Ok(Frame::Packet(data))) => {
                let mut body = TagReader::new(data);
                let (command, tag) = read_header(&mut body)?
                    .ok_or(HarnessError::Unexpected("an unknown command id"))?;
                Ok(Incoming::Message(IncomingMessage { command, tag, body }))
            }
            Some(Ok(Frame::Memblock { channel, delta, data })) => {
                Ok(Incoming::Memblock { channel, delta, data })
            }
            Some(Err(err)) => Err(err.into()),
            None => Err(HarnessError::Closed),
        }
    }

    /// Receives a control packet, failing the script on stream data.
    pub async fn expect_message(&mut self) -> Result<IncomingMessage, HarnessError> {
        match self.recv().await? {
            Incoming::Message(msg) => Ok(msg),
            Incoming::Memblock { .. } => Err(HarnessError::Unexpected("a memory block")),
        }
    }

    /// Receives a control packet and checks its command.
    pub async fn expect_command(
        &mut self,
        command: Command,
    ) -> Result<IncomingMessage, HarnessError> {
        let msg = self.expect_message().await?;
        if msg.command != command {
            return Err(HarnessError::Unexpected("a different command"));
        }
        Ok(msg)
    }

    /// Receives stream data, failing the script on a control packet.
    pub async fn expect_memblock(&mut self) -> Result<(u32, u32, Bytes), HarnessError> {
        match self.recv().await? {
            Incoming::Memblock { channel, delta, data } => Ok((channel, delta, data)),
            Incoming::Message(_) => Err(HarnessError::Unexpected("a control packet")),
        }
    }

    /// Sends a `REPLY` for `tag` with the given body.
    pub async fn reply(
        &mut self,
        tag: u32,
        body: impl FnOnce(&mut TagWriter),
    ) -> Result<(), HarnessError> {
        self.send_packet(write_message(Command::Reply, tag, body)).await
    }

    /// Sends an `ERROR` for `tag`.
    pub async fn error(&mut self, tag: u32, code: Code) -> Result<(), HarnessError> {
        self.send_packet(write_message(Command::Error, tag, |w| {
            w.put_u32(code.to_wire());
        }))
        .await
    }

    /// Sends a server-initiated event.
    pub async fn event(
        &mut self,
        command: Command,
        body: impl FnOnce(&mut TagWriter),
    ) -> Result<(), HarnessError> {
        self.send_packet(write_message(command, EVENT_TAG, body)).await
    }

    /// Sends stream data to the client.
    pub async fn send_memblock(
        &mut self,
        channel: u32,
        delta: u32,
        data: Bytes,
    ) -> Result<(), HarnessError> {
        Ok(self.framed.send(Frame::Memblock { channel, delta, data }).await?)
    }

    /// Sends a raw pre-built packet, for scripting protocol violations.
    pub async fn send_packet(&mut self, packet: Bytes) -> Result<(), HarnessError> {
        Ok(self.framed.send(Frame::Packet(packet)).await?)
    }

    /// Runs the server side of the handshake.
    ///
    /// Checks the `AUTH` shape (version, cookie of the right length),
    /// answers it per `verdict`, and on acceptance also answers
    /// `SET_NAME`. Returns the client's display name, or `None` when
    /// the verdict rejected it.
    pub async fn handshake(
        &mut self,
        verdict: AuthVerdict,
    ) -> Result<Option<String>, HarnessError> {
        let mut auth = self.expect_command(Command::Auth).await?;
        let _version = auth.body.get_u32()?;
        let cookie = auth.body.get_arbitrary()?;
        if cookie.len() != COOKIE_LENGTH || !auth.body.eof() {
            return Err(HarnessError::Unexpected("a malformed AUTH body"));
        }

        match verdict {
            AuthVerdict::Reject(code) => {
                self.error(auth.tag, code).await?;
                return Ok(None);
            }
            AuthVerdict::Accept => {
                self.reply(auth.tag, |w| {
                    w.put_u32(PROTOCOL_VERSION);
                })
                .await?;
            }
        }

        let mut set_name = self.expect_command(Command::SetName).await?;
        let name = set_name.body.get_string()?;
        if !set_name.body.eof() {
            return Err(HarnessError::Unexpected("a malformed SET_NAME body"));
        }
        self.reply(set_name.tag, |_| {}).await?;
        Ok(Some(name))
    }

    /// Closes the connection, which the client observes as EOF.
    pub fn shutdown(self) {
        drop(self);
    }
}
