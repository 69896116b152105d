//! Registry records for listeners and channels.
//!
//! The session owns these; the embedder owns the actual sockets and refers
//! to them by port name (listeners) or channel id (channels).

use std::cmp;
use std::collections::VecDeque;

use bytes::Bytes;

/// A local listening port created on the server's instruction, keyed by the
/// server-assigned `portName`.
#[derive(Debug)]
pub struct Listener {
    pub port_name: String,
    pub bind_addr: String,
    /// Actually bound local port.
    pub port: u16,
    /// A single-use listener dies together with its sole channel.
    pub single_use: bool,
}

/// A listener the server has requested but the embedder has not yet bound
/// or rejected.
#[derive(Debug)]
pub(crate) struct PendingListener {
    pub port_name: String,
    pub bind_addr: String,
    /// Requested port, 0 for any.
    pub port: u16,
    pub single_use: bool,
    /// Correlation id to echo in `listen-rp`.
    pub cid: i32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    /// `raise-rq` sent, no `raise-rp` yet; no data may flow.
    Raising,
    /// Confirmed by the server; both pumps run.
    Raised,
}

/// One TCP connection multiplexed through the tunnel.
#[derive(Debug)]
pub(crate) struct Channel {
    pub port_name: String,
    pub state: ChannelState,
    /// Inbound data chunks waiting for the embedder to drain them onto the
    /// local socket.
    pub recvd: VecDeque<Bytes>,
}

impl Channel {
    pub fn new(port_name: String) -> Self {
        Channel {
            port_name,
            state: ChannelState::Raising,
            recvd: VecDeque::new(),
        }
    }

    /// Queue an inbound payload. Returns true when the buffer was empty, so
    /// the caller can edge-trigger a readable notification.
    pub fn buffer(&mut self, payload: Bytes) -> bool {
        let was_empty = self.recvd.is_empty();
        self.recvd.push_back(payload);
        was_empty
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.recvd.is_empty() {
            return Err(ReadError::Blocked);
        }
        let mut n = 0;
        while n < buf.len() {
            let mut seg = match self.recvd.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            let take = cmp::min(seg.len(), buf.len() - n);
            buf[n..n + take].copy_from_slice(&seg[..take]);
            n += take;
            if take < seg.len() {
                self.recvd.push_front(seg.split_off(take));
                break;
            }
        }
        Ok(n)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum ReadError {
    /// No data buffered; wait for the next readable event.
    #[fail(display = "no buffered data")]
    Blocked,
    #[fail(display = "unknown channel id")]
    UnknownChannel,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum WriteError {
    /// The server has not confirmed the channel with `raise-rp` yet.
    #[fail(display = "channel has not been raised")]
    NotRaised,
    #[fail(display = "unknown channel id")]
    UnknownChannel,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_across_segments() {
        let mut chan = Channel::new("p".to_string());
        assert!(chan.buffer(Bytes::from(&b"hell"[..])));
        assert!(!chan.buffer(Bytes::from(&b"o"[..])));
        let mut buf = [0; 8];
        assert_eq!(chan.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_matches!(chan.read(&mut buf), Err(ReadError::Blocked));
    }

    #[test]
    fn short_read_leaves_remainder() {
        let mut chan = Channel::new("p".to_string());
        chan.buffer(Bytes::from(&b"abcdef"[..]));
        let mut buf = [0; 4];
        assert_eq!(chan.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(chan.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
