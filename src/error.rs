//! Error codes shared between the wire protocol and the client API.

use thiserror::Error;

/// Error condition attached to a [`Context`](crate::Context), an
/// operation completion, or an `ERROR` reply on the wire.
///
/// The numeric values are the on-wire representation; the server echoes
/// them back verbatim in `ERROR` replies.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[non_exhaustive]
pub enum Code {
    /// No error.
    #[error("success")]
    Ok = 0,
    /// The authentication cookie was missing, short, or rejected.
    #[error("access denied: bad authentication cookie")]
    AuthKey = 1,
    /// The daemon refused the connection attempt.
    #[error("connection refused")]
    ConnectionRefused = 2,
    /// The transport died while a session was open.
    #[error("connection terminated")]
    ConnectionTerminated = 3,
    /// The server address could not be parsed or resolved.
    #[error("invalid server address")]
    InvalidServer = 4,
    /// The peer violated the protocol; the framing can no longer be trusted.
    #[error("protocol error")]
    Protocol = 5,
    /// A request went unanswered past its deadline.
    #[error("operation timed out")]
    Timeout = 6,
    /// The entity is not in a state that allows the requested call.
    #[error("bad state for this call")]
    BadState = 7,
    /// The server killed a stream out from under the client.
    #[error("entity killed by server")]
    Killed = 8,
    /// An argument failed validation before anything was sent.
    #[error("invalid argument")]
    Invalid = 9,
}

impl Code {
    /// Decodes a wire error code. Unknown values collapse to
    /// [`Code::Protocol`] since the peer is speaking something we don't.
    pub fn from_wire(raw: u32) -> Code {
        match raw {
            0 => Code::Ok,
            1 => Code::AuthKey,
            2 => Code::ConnectionRefused,
            3 => Code::ConnectionTerminated,
            4 => Code::InvalidServer,
            5 => Code::Protocol,
            6 => Code::Timeout,
            7 => Code::BadState,
            8 => Code::Killed,
            9 => Code::Invalid,
            _ => Code::Protocol,
        }
    }

    /// The on-wire representation.
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Whether the code represents success.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for code in [
            Code::Ok,
            Code::AuthKey,
            Code::ConnectionRefused,
            Code::ConnectionTerminated,
            Code::InvalidServer,
            Code::Protocol,
            Code::Timeout,
            Code::BadState,
            Code::Killed,
            Code::Invalid,
        ] {
            assert_eq!(Code::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn unknown_wire_code_is_a_protocol_error() {
        assert_eq!(Code::from_wire(0xdead_beef), Code::Protocol);
    }
}
