//! State machine for a multiplexed, reconnectable TCP-over-HTTP tunnel.
//!
//! This library implements the client side of a tunnel protocol that carries
//! arbitrary TCP socket channels over a single long-lived HTTP POST body.
//! The server instructs the client to open local listening ports; every
//! local connection accepted on such a port becomes a *channel* whose bytes
//! travel inside framed chunks sharing one outbound stream, while chunks
//! from the server are demultiplexed back onto the local sockets. Chunks
//! carry sequence numbers and acknowledgements so that a dropped transport
//! can be resumed without losing bytes.
//!
//! This object performs no I/O whatsoever. A [`Session`](session/struct.Session.html)
//! consumes inbound HTTP-body bytes via `recv`, yields outbound bytes via
//! `send`, surfaces application events via `poll` and timer commands via
//! `poll_io`, and is informed of timer expiry via `timeout`. Sockets, HTTP
//! transports, TLS and the event loop all belong to the embedder.

extern crate base64;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate fnv;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
extern crate slog_term;

mod channel;
mod chunk;
mod coding;
mod message;
mod session;

pub use channel::{ChannelState, Listener, ReadError, WriteError};
pub use chunk::{Chunk, ChunkDecodeError};
pub use message::{MsgBuilder, MsgError, MsgReader};
pub use session::{Config, Event, Io, ListenerHandle, Session, State, Timer};

pub mod msg {
    //! Message type names exchanged as `messageType` in message chunk
    //! headers. Reserved names are accepted and logged but have no default
    //! handler.
    pub use message::{
        AUTHENTICATED, AUTH_RP, AUTH_RQ, CLIENT_ERROR, ECHO_RP, ECHO_RQ, ERROR, INIT, LISTEN_RP,
        LISTEN_RQ, LOWER, OPENURL_RP, OPENURL_RQ, PAC_REPLY, PAC_UPDATE, PLEASE_AUTH, PLEASE_INIT,
        RAISE_RP, RAISE_RQ, READY, SECURITY_MSG, START, STOP, SYSMSG, TGS_REP, TGS_REQ, TID_RQ,
        UNLISTEN_RP, UNLISTEN_RQ,
    };
}

/// Largest payload carried by one data chunk.
///
/// The tunnel server pools fixed-size buffers, so this bound is part of the
/// wire contract rather than a local tuning knob.
pub const MAX_DATA_LEN: usize = 10 * 1024;

/// Longest `portName` the server may assign to a listener.
pub const MAX_PORT_NAME_LEN: usize = 23;

/// URL path appended to the server address for an initial connect.
pub const CONNECT_URL_PATH: &'static str = "/ice/tunnel";
/// URL path appended to the server address for a reconnect.
pub const RECONNECT_URL_PATH: &'static str = "/ice/reconnect";

/// Errors arising from misuse of the session API.
///
/// These are all recoverable; the session state is unchanged when one is
/// returned.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum TunnelError {
    /// The session has never been connected.
    #[fail(display = "not connected")]
    NotConnected,
    /// `connect` was called on a previously connected session that holds no
    /// reconnect secret.
    #[fail(display = "reconnect attempted without a reconnect secret")]
    InvalidReconnect,
    /// No listener is registered under the given port name.
    #[fail(display = "unknown listener")]
    InvalidListener,
    /// No channel is registered under the given id.
    #[fail(display = "unknown channel id")]
    InvalidChannelId,
}
