//! Command vocabulary of the Cadenza native protocol.
//!
//! Every control-channel packet starts with two tagged `u32`s (command
//! id, then client tag) followed by command-specific fields. Replies
//! echo the tag of the request they answer; server-initiated events use
//! a tag of [`EVENT_TAG`].

use bytes::Bytes;

use crate::tagstruct::{TagError, TagReader, TagWriter};

/// Protocol revision spoken by this crate. Sent in `AUTH`, answered by
/// the server with its own revision; both sides use the minimum.
pub const PROTOCOL_VERSION: u32 = 1;

/// Tag value carried by server-initiated event packets.
pub const EVENT_TAG: u32 = u32::MAX;

/// Command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Error = 0,
    /// Synthesized locally when a reply deadline expires; never on the wire.
    Timeout = 1,
    Reply = 2,

    Auth = 10,
    SetName = 11,
    Subscribe = 12,
    Exit = 13,

    CreatePlaybackStream = 20,
    DeletePlaybackStream = 21,
    CreateRecordStream = 22,
    DeleteRecordStream = 23,

    Request = 50,
    PlaybackStreamKilled = 51,
    RecordStreamKilled = 52,
    SubscribeEvent = 53,
}

impl Command {
    pub fn from_wire(raw: u32) -> Option<Command> {
        Some(match raw {
            0 => Command::Error,
            1 => Command::Timeout,
            2 => Command::Reply,
            10 => Command::Auth,
            11 => Command::SetName,
            12 => Command::Subscribe,
            13 => Command::Exit,
            20 => Command::CreatePlaybackStream,
            21 => Command::DeletePlaybackStream,
            22 => Command::CreateRecordStream,
            23 => Command::DeleteRecordStream,
            50 => Command::Request,
            51 => Command::PlaybackStreamKilled,
            52 => Command::RecordStreamKilled,
            53 => Command::SubscribeEvent,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Whether this command answers a pending client request.
    pub fn is_reply(self) -> bool {
        matches!(self, Command::Reply | Command::Error)
    }
}

/// Builds one complete tagged packet: header, then `body` fields.
pub fn write_message(command: Command, tag: u32, body: impl FnOnce(&mut TagWriter)) -> Bytes {
    let mut w = TagWriter::new();
    w.put_u32(command.to_wire());
    w.put_u32(tag);
    body(&mut w);
    w.into_bytes()
}

/// Reads the two-field packet header, leaving the reader at the body.
///
/// An unknown command id is returned as `Ok(None)` so the caller can
/// fail the session with a protocol error rather than a parse error.
pub fn read_header(r: &mut TagReader) -> Result<Option<(Command, u32)>, TagError> {
    let raw = r.get_u32()?;
    let tag = r.get_u32()?;
    Ok(Command::from_wire(raw).map(|command| (command, tag)))
}

/// Server-initiated events, decoded from their tagged bodies.
///
/// This is the full table of commands the server may push outside the
/// request/reply flow; anything else from the server fails the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Flow control: the server wants `bytes` more on a playback channel.
    Request { channel: u32, bytes: u32 },
    PlaybackStreamKilled { channel: u32 },
    RecordStreamKilled { channel: u32 },
    /// A change notification; `bits` packs facility and operation.
    SubscribeEvent { bits: u32, index: u32 },
}

impl ServerEvent {
    /// Decodes the body of a known event command. Returns `Ok(None)` for
    /// commands that are not events.
    pub fn parse(command: Command, r: &mut TagReader) -> Result<Option<ServerEvent>, TagError> {
        let event = match command {
            Command::Request => ServerEvent::Request {
                channel: r.get_u32()?,
                bytes: r.get_u32()?,
            },
            Command::PlaybackStreamKilled => ServerEvent::PlaybackStreamKilled {
                channel: r.get_u32()?,
            },
            Command::RecordStreamKilled => ServerEvent::RecordStreamKilled {
                channel: r.get_u32()?,
            },
            Command::SubscribeEvent => ServerEvent::SubscribeEvent {
                bits: r.get_u32()?,
                index: r.get_u32()?,
            },
            _ => return Ok(None),
        };
        if !r.eof() {
            return Err(TagError::Trailing);
        }
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagstruct::TagReader;

    #[test]
    fn header_round_trip() {
        let packet = write_message(Command::SetName, 42, |w| {
            w.put_string("player");
        });
        let mut r = TagReader::new(packet);
        let (command, tag) = read_header(&mut r).unwrap().unwrap();
        assert_eq!(command, Command::SetName);
        assert_eq!(tag, 42);
        assert_eq!(r.get_string().unwrap(), "player");
        assert!(r.eof());
    }

    #[test]
    fn unknown_command_id_yields_none() {
        let mut w = TagWriter::new();
        w.put_u32(999).put_u32(1);
        let mut r = TagReader::new(w.into_bytes());
        assert_eq!(read_header(&mut r).unwrap(), None);
    }

    #[test]
    fn event_bodies_decode() {
        let packet = write_message(Command::Request, EVENT_TAG, |w| {
            w.put_u32(3).put_u32(4096);
        });
        let mut r = TagReader::new(packet);
        let (command, tag) = read_header(&mut r).unwrap().unwrap();
        assert_eq!(tag, EVENT_TAG);
        assert_eq!(
            ServerEvent::parse(command, &mut r).unwrap(),
            Some(ServerEvent::Request {
                channel: 3,
                bytes: 4096,
            })
        );
    }

    #[test]
    fn trailing_bytes_after_event_body_are_rejected() {
        let packet = write_message(Command::PlaybackStreamKilled, EVENT_TAG, |w| {
            w.put_u32(3).put_u32(77);
        });
        let mut r = TagReader::new(packet);
        let (command, _) = read_header(&mut r).unwrap().unwrap();
        assert_eq!(
            ServerEvent::parse(command, &mut r),
            Err(TagError::Trailing)
        );
    }

    #[test]
    fn replies_are_not_events() {
        let packet = write_message(Command::Reply, 7, |_| {});
        let mut r = TagReader::new(packet);
        let (command, _) = read_header(&mut r).unwrap().unwrap();
        assert!(command.is_reply());
        assert_eq!(ServerEvent::parse(command, &mut r).unwrap(), None);
    }
}
