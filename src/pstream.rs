//! Packet-stream framing: the byte-level transport under the session.
//!
//! A single socket carries two kinds of frames, distinguished by the
//! channel field of a fixed 16-byte header: control packets (tagged
//! messages, channel [`CONTROL_CHANNEL`]) and bulk memory blocks bound
//! for a record or playback channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Code;

/// Channel id marking a frame as a control packet rather than stream data.
pub const CONTROL_CHANNEL: u32 = u32::MAX;

/// Upper bound on a single frame payload.
pub const FRAME_SIZE_MAX: usize = 1024 * 1024;

const HEADER_SIZE: usize = 16;

/// One decoded frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A tagged control message.
    Packet(Bytes),
    /// An audio memory block for a stream channel.
    Memblock { channel: u32, delta: u32, data: Bytes },
}

/// Framing failure. Anything but plain I/O means the peer's framing can
/// no longer be trusted.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame payload of {0} bytes exceeds the {FRAME_SIZE_MAX} byte limit")]
    Oversized(usize),
    #[error("frame header carries non-zero reserved flags")]
    ReservedFlags,
}

/// Length-delimited codec for [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > FRAME_SIZE_MAX {
            return Err(FrameError::Oversized(length));
        }
        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let channel = src.get_u32();
        let delta = src.get_u32();
        let flags = src.get_u32();
        if flags != 0 {
            return Err(FrameError::ReservedFlags);
        }
        let data = src.split_to(length).freeze();

        Ok(Some(if channel == CONTROL_CHANNEL {
            Frame::Packet(data)
        } else {
            Frame::Memblock { channel, delta, data }
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let (channel, delta, data) = match frame {
            Frame::Packet(data) => (CONTROL_CHANNEL, 0, data),
            Frame::Memblock { channel, delta, data } => (channel, delta, data),
        };
        if data.len() > FRAME_SIZE_MAX {
            return Err(FrameError::Oversized(data.len()));
        }

        dst.reserve(HEADER_SIZE + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_u32(channel);
        dst.put_u32(delta);
        dst.put_u32(0);
        dst.put_slice(&data);
        Ok(())
    }
}

/// Handle onto the driver's outgoing frame queue.
///
/// The depth counter covers everything submitted but not yet flushed to
/// the socket; its transition to zero is the "send queue empty" signal
/// consumed by the drain coordinator.
#[derive(Debug, Clone)]
pub(crate) struct SendQueue {
    tx: mpsc::UnboundedSender<Frame>,
    depth: Arc<AtomicUsize>,
}

impl SendQueue {
    pub(crate) fn new() -> (SendQueue, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SendQueue {
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub(crate) fn submit(&self, frame: Frame) -> Result<(), Code> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            Code::ConnectionTerminated
        })
    }

    /// Marks one submitted frame as flushed; true when the queue drained.
    pub(crate) fn complete_one(&self) -> bool {
        self.depth.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn packet_frames_round_trip() {
        let mut buf = encode(Frame::Packet(Bytes::from_static(b"hello")));
        let frame = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Packet(Bytes::from_static(b"hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn memblock_frames_carry_channel_and_delta() {
        let mut buf = encode(Frame::Memblock {
            channel: 9,
            delta: 2,
            data: Bytes::from_static(&[0u8; 32]),
        });
        match FrameCodec::new().decode(&mut buf).unwrap().unwrap() {
            Frame::Memblock { channel, delta, data } => {
                assert_eq!(channel, 9);
                assert_eq!(delta, 2);
                assert_eq!(data.len(), 32);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let full = encode(Frame::Packet(Bytes::from_static(b"abcdef")));
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        let mut codec = FrameCodec::new();
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 2..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn two_frames_in_one_read_both_decode() {
        let mut buf = encode(Frame::Packet(Bytes::from_static(b"one")));
        buf.unsplit(encode(Frame::Memblock {
            channel: 1,
            delta: 0,
            data: Bytes::from_static(b"two"),
        }));
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Frame::Packet(_)
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Frame::Memblock { channel: 1, .. }
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_SIZE_MAX + 1) as u32);
        buf.put_u32(CONTROL_CHANNEL);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn reserved_flags_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(CONTROL_CHANNEL);
        buf.put_u32(0);
        buf.put_u32(1);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(FrameError::ReservedFlags)
        ));
    }

    #[test]
    fn send_queue_depth_tracks_submissions() {
        let (queue, mut rx) = SendQueue::new();
        queue.submit(Frame::Packet(Bytes::new())).unwrap();
        queue.submit(Frame::Packet(Bytes::new())).unwrap();
        assert_eq!(queue.depth(), 2);

        rx.try_recv().unwrap();
        assert!(!queue.complete_one());
        rx.try_recv().unwrap();
        assert!(queue.complete_one());
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn submit_after_receiver_drop_reports_termination() {
        let (queue, rx) = SendQueue::new();
        drop(rx);
        assert_eq!(
            queue.submit(Frame::Packet(Bytes::new())),
            Err(Code::ConnectionTerminated)
        );
        assert_eq!(queue.depth(), 0);
    }
}
