//! Native client implementation of the Cadenza audio daemon protocol.
//!
//! A [`Context`] holds one session against a daemon: it connects over a
//! UNIX socket or TCP, authenticates with the per-user cookie,
//! negotiates a display name, and then multiplexes tagged
//! request/reply commands, server-pushed events, and bulk audio blocks
//! over a single framed transport. [`Stream`]s are the per-channel
//! playback and record children of a context.
//!
//! Everything is asynchronous on top of a Tokio runtime: requests
//! return [`Operation`] handles and complete through callbacks, and the
//! connection lifecycle is observed through a state callback.

pub mod context;
pub mod cookie;
#[cfg(unix)]
pub mod e2e_common;
pub mod error;
pub mod memblock;
pub mod messages;
pub mod operation;
pub mod pstream;
pub mod server;
pub mod stream;
pub mod tagstruct;

mod callbacks;
mod pdispatch;

pub use context::subscribe::{EventOperation, Facility, InterestMaskSet};
pub use context::{Context, State};
pub use cookie::{AuthCookie, COOKIE_LENGTH};
pub use error::Code;
pub use memblock::{Chunk, Memblock, MemblockStat, MemblockStatSnapshot};
pub use operation::{Operation, OperationState};
pub use server::{ServerAddr, DEFAULT_PORT, SERVER_ENV};
pub use stream::{Direction, Stream, StreamState};
