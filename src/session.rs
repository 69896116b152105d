use std::collections::VecDeque;
use std::mem;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use slab::Slab;
use slog::{self, Logger};

use channel::{Channel, ChannelState, Listener, PendingListener, ReadError, WriteError};
use chunk::{Chunk, ChunkDecodeError};
use message::{self, MsgBuilder, MsgError, MsgReader};
use {TunnelError, CONNECT_URL_PATH, MAX_DATA_LEN, MAX_PORT_NAME_LEN, RECONNECT_URL_PATH};

/// Inbound chunks tolerated before a bare ack is queued to catch up.
const MAX_UNACKNOWLEDGED: u32 = 4;
/// Unacked outbound chunks beyond which data serialization stops.
const START_FLOW_CONTROL: u32 = 4 * MAX_UNACKNOWLEDGED;
/// Unacked outbound chunks below which data serialization resumes.
const END_FLOW_CONTROL: u32 = MAX_UNACKNOWLEDGED;

/// Parameters of the initial protocol exchange.
///
/// The defaults match the servers this client was written against; nothing
/// else in the protocol is tunable, the flow-control thresholds and data
/// chunk bound being wire invariants.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client type tag sent in `init` and `start`.
    pub client_type: String,
    /// Protocol version triple sent in `init`.
    pub version: (i32, i32, i32),
    /// Correlation id sent in `init`; the server must echo it in
    /// `please-init`.
    pub correlation_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_type: "C".to_string(),
            version: (3, 1, 4),
            correlation_id: "1234".to_string(),
        }
    }
}

/// Session life cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Never connected.
    Idle,
    /// `init` queued, waiting for `please-init`.
    Initializing,
    /// `start` sent, waiting for `authenticated`.
    Starting,
    /// Authenticated, waiting for `ready`.
    Authenticated,
    /// Fully usable for channel traffic.
    Ready,
    /// Transport dropped with a valid reconnect secret; waiting for the
    /// owner to call `connect` again.
    Reconnecting,
    /// Terminal.
    Stopped,
}

/// Identifies a listener the server requested but the embedder has not yet
/// bound or rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerHandle(pub usize);

/// Events of interest to the embedding application.
#[derive(Debug)]
pub enum Event {
    /// The server finished the handshake; channel traffic may flow.
    Ready,
    /// The server asked for a local listening port. The embedder binds (or
    /// refuses) and completes with `listener_ready` or `listener_rejected`.
    ListenRequested {
        listener: ListenerHandle,
        port_name: String,
        bind_addr: String,
        /// Requested port, 0 for any.
        port: u16,
        single_use: bool,
    },
    /// A listener was torn down; the embedder should drop its socket.
    ListenerClosed { port_name: String, port: u16 },
    /// The server confirmed a channel; the embedder starts its read pump.
    ChannelRaised { id: u32, port_name: String },
    /// Buffered inbound data became available; drain with `read`.
    ChannelReadable { id: u32 },
    /// A channel died; the embedder should drop its socket.
    ChannelClosed { id: u32, port_name: String },
    /// Informational message from the server.
    SystemMessage { msg: String },
    /// Error message from the server.
    ErrorMessage { msg: String },
    /// Serializable chunks are pending; the adapter should drain `send`.
    SendNeeded,
    /// The session lost its transport. With a secret the owner may call
    /// `connect` again; without one the session is stopped.
    Disconnected {
        secret: Option<String>,
        reason: Option<String>,
    },
}

/// Timer operations for the embedder's poll loop to execute immediately.
#[derive(Debug)]
pub enum Io {
    /// Start or reset a timer.
    TimerStart {
        timer: Timer,
        /// Absolute ms.
        time: u64,
    },
    TimerStop { timer: Timer },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum Timer {
    /// Periodic `echo-rq` heartbeat.
    Echo,
    /// One-shot inbound-silence watchdog.
    LostContact,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

type ExtHandler = Box<dyn FnMut(&mut Session, &str, &[u8]) -> bool>;

enum Handler {
    Builtin(Builtin),
    Ext(ExtHandler),
}

#[derive(Debug, Copy, Clone)]
enum Builtin {
    Authenticated,
    EchoRq,
    EchoRp,
    Error,
    ListenRq,
    Lower,
    PleaseInit,
    RaiseRp,
    Ready,
    Stop,
    SysMsg,
    UnlistenRq,
}

struct Registration {
    msg_id: String,
    handler: Handler,
}

/// One live (or reconnecting) tunnel.
///
/// This object performs no I/O. Inbound HTTP-body bytes enter through
/// [`recv`](#method.recv); outbound bytes leave through
/// [`send`](#method.send); timer commands surface via
/// [`poll_io`](#method.poll_io) and expiry is reported back through
/// [`timeout`](#method.timeout); everything else of interest is an
/// [`Event`](enum.Event.html) from [`poll`](#method.poll). Several sessions
/// may coexist; nothing is shared between them.
pub struct Session {
    log: Logger,
    config: Config,
    state: State,
    cap_id: Option<String>,
    host_ip: String,
    host_name: String,
    reconnect_secret: Option<String>,
    /// From `authenticated`, ms. Zero until then.
    lost_contact_timeout: u64,
    /// From `authenticated`, ms. Stored only; the server has not yet given
    /// this a client-visible meaning.
    disconnected_timeout: u64,
    connected_once: bool,

    //
    // Sequence and ack bookkeeping
    //
    pub(crate) last_chunk_id_seen: u32,
    pub(crate) last_chunk_ack_seen: u32,
    pub(crate) last_chunk_id_sent: u32,
    pub(crate) last_chunk_ack_sent: u32,
    flow_stopped: bool,

    //
    // Outgoing fifos
    //
    /// Chunks not yet serialized. Chunk ids are assigned at serialization
    /// time so that replay after a reconnect preserves them.
    pub(crate) queue_out: VecDeque<Chunk>,
    /// Serialized chunks awaiting acknowledgement, ascending chunk id.
    pub(crate) queue_out_need_ack: VecDeque<Chunk>,

    read_buf: BytesMut,
    write_buf: Vec<u8>,

    //
    // Registries
    //
    listeners: FnvHashMap<String, Listener>,
    pending_listeners: Slab<PendingListener>,
    channels: FnvHashMap<u32, Channel>,
    max_channel_id: u32,

    handlers: Vec<Registration>,

    events: VecDeque<Event>,
    io: VecDeque<Io>,
}

impl Session {
    /// Create a session. `cap_id` is the tunnel identifier obtained from
    /// the broker, if one is already known; the server (re)states it in
    /// `authenticated`.
    pub fn new(log: Logger, config: Config, cap_id: Option<String>) -> Self {
        let mut this = Session {
            log,
            config,
            state: State::Idle,
            cap_id,
            host_ip: String::new(),
            host_name: String::new(),
            reconnect_secret: None,
            lost_contact_timeout: 0,
            disconnected_timeout: 0,
            connected_once: false,

            last_chunk_id_seen: 0,
            last_chunk_ack_seen: 0,
            last_chunk_id_sent: 0,
            last_chunk_ack_sent: 0,
            flow_stopped: false,

            queue_out: VecDeque::new(),
            queue_out_need_ack: VecDeque::new(),

            read_buf: BytesMut::new(),
            write_buf: Vec::new(),

            listeners: FnvHashMap::default(),
            pending_listeners: Slab::new(),
            channels: FnvHashMap::default(),
            max_channel_id: 0,

            handlers: Vec::new(),

            events: VecDeque::new(),
            io: VecDeque::new(),
        };
        for &(msg_id, builtin) in &[
            (message::AUTHENTICATED, Builtin::Authenticated),
            (message::ECHO_RQ, Builtin::EchoRq),
            (message::ECHO_RP, Builtin::EchoRp),
            (message::ERROR, Builtin::Error),
            (message::LISTEN_RQ, Builtin::ListenRq),
            (message::LOWER, Builtin::Lower),
            (message::PLEASE_INIT, Builtin::PleaseInit),
            (message::RAISE_RP, Builtin::RaiseRp),
            (message::READY, Builtin::Ready),
            (message::STOP, Builtin::Stop),
            (message::SYSMSG, Builtin::SysMsg),
            (message::UNLISTEN_RQ, Builtin::UnlistenRq),
        ] {
            this.handlers.push(Registration {
                msg_id: msg_id.to_string(),
                handler: Handler::Builtin(builtin),
            });
        }
        this
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cap_id(&self) -> Option<&str> {
        self.cap_id.as_ref().map(|s| s.as_str())
    }

    pub fn reconnect_secret(&self) -> Option<&str> {
        self.reconnect_secret.as_ref().map(|s| s.as_str())
    }

    pub fn flow_stopped(&self) -> bool {
        self.flow_stopped
    }

    /// Inbound-silence budget from `authenticated`, ms. Zero before then.
    pub fn lost_contact_timeout(&self) -> u64 {
        self.lost_contact_timeout
    }

    /// Reconnect window from `authenticated`, ms. Stored for the embedder;
    /// the core takes no action on it.
    pub fn disconnected_timeout(&self) -> u64 {
        self.disconnected_timeout
    }

    pub fn listener(&self, port_name: &str) -> Option<&Listener> {
        self.listeners.get(port_name)
    }

    pub fn channel_state(&self, channel_id: u32) -> Option<ChannelState> {
        self.channels.get(&channel_id).map(|c| c.state)
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Get a pending timer operation.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.io.pop_front()
    }

    //
    // Connection lifecycle
    //

    /// Connect or reconnect.
    ///
    /// The first call queues the `init` message. Later calls are
    /// reconnects: they require a reconnect secret and replay every
    /// unacknowledged chunk, ids preserved, onto the new transport.
    /// `host_ip`/`host_name` identify this client to the server in `start`
    /// and default to the loopback identity.
    pub fn connect(
        &mut self,
        now: u64,
        host_ip: Option<&str>,
        host_name: Option<&str>,
    ) -> Result<(), TunnelError> {
        let is_reconnect = self.connected_once;
        if is_reconnect && self.reconnect_secret.is_none() {
            return Err(TunnelError::InvalidReconnect);
        }
        self.connected_once = true;

        self.host_ip = host_ip.unwrap_or("127.0.0.1").to_string();
        self.host_name = host_name.unwrap_or("localhost").to_string();

        // The transport is fresh; anything half-parsed or half-drained on
        // the old one is void.
        self.read_buf.clear();
        self.write_buf.clear();

        if is_reconnect {
            debug!(self.log, "reconnecting";
                   "pending" => self.queue_out_need_ack.len());
            self.arm_timeouts(now);
            while let Some(chunk) = self.queue_out_need_ack.pop_back() {
                self.queue_out.push_front(chunk);
            }
            // Ack the last chunk id we saw on the first chunk out.
            self.last_chunk_ack_sent = 0;
            self.state = State::Ready;
            self.fire_send_needed();
        } else {
            let body = MsgBuilder::new()
                .string("type", &self.config.client_type)
                .int("v1", self.config.version.0)
                .int("v2", self.config.version.1)
                .int("v3", self.config.version.2)
                .string("cid", &self.config.correlation_id)
                .finish();
            self.send_msg(message::INIT, body);
            self.state = State::Initializing;
        }
        Ok(())
    }

    /// The URL the transport should POST to, derived from the broker's
    /// server URL and the session's current identity.
    pub fn connect_url(&self, server_url: &str) -> String {
        match (self.cap_id.as_ref(), self.reconnect_secret.as_ref()) {
            (Some(cap_id), Some(secret)) => format!(
                "{}{}?{}&{}",
                server_url, RECONNECT_URL_PATH, cap_id, secret
            ),
            (Some(cap_id), None) => format!("{}{}?{}", server_url, CONNECT_URL_PATH, cap_id),
            (None, _) => format!("{}{}", server_url, CONNECT_URL_PATH),
        }
    }

    /// Owner-initiated teardown: cancel timers, close every listener and
    /// channel, no disconnect notification.
    pub fn disconnect(&mut self) -> Result<(), TunnelError> {
        let r = self.disconnect_inner(None, true, false);
        if r.is_ok() {
            self.state = State::Stopped;
        }
        r
    }

    fn disconnect_inner(
        &mut self,
        reason: Option<String>,
        close_sockets: bool,
        notify: bool,
    ) -> Result<(), TunnelError> {
        if !self.connected_once {
            return Err(TunnelError::NotConnected);
        }

        self.stop_timeouts();

        if close_sockets {
            let names: Vec<String> = self.listeners.keys().cloned().collect();
            for port_name in names {
                let _ = self.close_listener(&port_name);
            }
            self.pending_listeners.clear();
        }

        if notify {
            let secret = self.reconnect_secret.clone();
            self.events.push_back(Event::Disconnected { secret, reason });
        }
        Ok(())
    }

    /// Report a transport failure (read/write error on the HTTP stream).
    ///
    /// With a reconnect secret and an authenticated session this leaves all
    /// listeners in place and waits for the owner to `connect` again;
    /// otherwise the session stops.
    pub fn transport_error(&mut self, reason: &str) {
        let resumable = self.reconnect_secret.is_some() && match self.state {
            State::Authenticated | State::Ready => true,
            _ => false,
        };
        if resumable {
            debug!(self.log, "transport dropped, reconnect allowed";
                   "reason" => reason);
            self.stop_timeouts();
            let secret = self.reconnect_secret.clone();
            self.events.push_back(Event::Disconnected {
                secret,
                reason: Some(reason.to_string()),
            });
            self.state = State::Reconnecting;
        } else {
            warn!(self.log, "TUNNEL DISCONNECT: {reason}", reason = reason);
            self.reconnect_secret = None;
            let _ = self.disconnect_inner(Some(reason.to_string()), true, true);
            self.state = State::Stopped;
        }
    }

    /// Fatal protocol failure: stop the session, no reconnect.
    fn protocol_fatal(&mut self) {
        warn!(self.log, "TUNNEL DISCONNECT: protocol error");
        self.reconnect_secret = None;
        let _ = self.disconnect_inner(Some("protocol error".to_string()), true, true);
        self.state = State::Stopped;
    }

    //
    // HTTP IO driver interface
    //

    /// Push inbound tunnel bytes from the transport.
    ///
    /// Whole chunks are processed immediately; a partial trailing chunk
    /// stays buffered for the next call. A malformed chunk is fatal: the
    /// session stops, the owner is notified, and the error is returned for
    /// the adapter to abandon the stream.
    pub fn recv(
        &mut self,
        now: u64,
        data: &[u8],
        http_chunked: bool,
    ) -> Result<(), ChunkDecodeError> {
        if self.state == State::Stopped {
            return Ok(());
        }
        self.read_buf.extend_from_slice(data);

        let mut consumed = 0;
        let mut parsed_any = false;
        loop {
            match Chunk::decode(&self.read_buf[consumed..], http_chunked) {
                Ok(Some((chunk, used))) => {
                    consumed += used;
                    parsed_any = true;
                    self.handle_chunk(now, chunk);
                    if self.state == State::Stopped {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(self.log, "malformed tunnel chunk: {err}", err = e.to_string());
                    self.protocol_fatal();
                    return Err(e);
                }
            }
        }
        if consumed > 0 {
            self.read_buf.split_to(consumed);
        }
        if !parsed_any || self.state == State::Stopped {
            return Ok(());
        }

        // Contact is proven; push the watchdogs out.
        self.arm_timeouts(now);

        self.update_flow_control();

        // Queue a bare ack if we haven't acked in a while.
        if self.last_chunk_id_seen - self.last_chunk_ack_sent >= MAX_UNACKNOWLEDGED {
            debug!(self.log, "queueing catch-up ack";
                   "seen" => self.last_chunk_id_seen,
                   "acked" => self.last_chunk_ack_sent);
            self.enqueue_chunk(Chunk::Ack { ack_id: 0 });
        }
        Ok(())
    }

    /// Drain up to `buf.len()` outbound bytes into `buf`, serializing
    /// queued chunks as needed; returns the byte count written.
    ///
    /// With `http_chunked` the codec wraps each chunk itself and serializes
    /// as many as are eligible; without it exactly one chunk is serialized
    /// per call so the caller can apply its own outer framing.
    pub fn send(&mut self, buf: &mut [u8], http_chunked: bool) -> usize {
        while self.write_next_chunk(http_chunked) && http_chunked {}

        let n = ::std::cmp::min(self.write_buf.len(), buf.len());
        buf[..n].copy_from_slice(&self.write_buf[..n]);
        self.write_buf.drain(..n);
        n
    }

    /// Whether `send` would produce bytes right now.
    pub fn send_needed(&self) -> bool {
        !self.write_buf.is_empty()
            || self
                .queue_out
                .iter()
                .any(|c| !(self.flow_stopped && c.is_data()))
    }

    /// Serialize the next eligible chunk into the write buffer. Data chunks
    /// are skipped while flow is stopped; control traffic keeps moving.
    fn write_next_chunk(&mut self, http_chunked: bool) -> bool {
        loop {
            let pos = {
                let mut pos = None;
                for (i, chunk) in self.queue_out.iter().enumerate() {
                    if !(self.flow_stopped && chunk.is_data()) {
                        pos = Some(i);
                        break;
                    }
                }
                match pos {
                    Some(i) => i,
                    None => return false,
                }
            };
            let mut chunk = match self.queue_out.remove(pos) {
                Some(chunk) => chunk,
                None => return false,
            };

            // A catch-up ack that was overtaken by a piggybacked ack
            // carries no information; drop it rather than emit `A;0;`.
            if chunk.is_ack() && self.last_chunk_ack_sent >= self.last_chunk_id_seen {
                continue;
            }

            // Assign the next chunk id unless this is an ack or a resent
            // chunk following a reconnect.
            if !chunk.is_ack() && chunk.chunk_id() == 0 {
                self.last_chunk_id_sent += 1;
                chunk.set_chunk_id(self.last_chunk_id_sent);
            }
            if self.last_chunk_ack_sent < self.last_chunk_id_seen {
                chunk.set_ack_id(self.last_chunk_id_seen);
                self.last_chunk_ack_sent = self.last_chunk_id_seen;
            }

            trace!(self.log, "serializing chunk";
                   "id" => chunk.chunk_id(), "ack" => chunk.ack_id());
            chunk.encode(http_chunked, &mut self.write_buf);

            if !chunk.is_ack() {
                self.queue_out_need_ack.push_back(chunk);
            }
            self.update_flow_control();
            return true;
        }
    }

    //
    // Inbound chunk processing
    //

    fn handle_chunk(&mut self, now: u64, chunk: Chunk) {
        let chunk_id = chunk.chunk_id();
        let ack_id = chunk.ack_id();

        let replayed = chunk_id > 0 && chunk_id <= self.last_chunk_id_seen;
        if chunk_id > self.last_chunk_id_seen {
            self.last_chunk_id_seen = chunk_id;
        }

        // Ack accounting runs even for replayed chunks; a replay can still
        // advance the outbound head.
        if ack_id > 0 {
            if ack_id > self.last_chunk_id_sent {
                warn!(self.log, "unknown ack id {id} in received chunk", id = ack_id);
            }
            if ack_id > self.last_chunk_ack_seen {
                while self
                    .queue_out_need_ack
                    .front()
                    .map_or(false, |c| c.chunk_id() <= ack_id)
                {
                    self.queue_out_need_ack.pop_front();
                }
                self.last_chunk_ack_seen = ack_id;
            }
        }

        if replayed {
            debug!(self.log, "skipping replayed chunk {id}", id = chunk_id);
            return;
        }

        match chunk {
            Chunk::Message { msg_id, body, .. } => {
                self.dispatch_message(now, &msg_id, &body);
            }
            Chunk::Data {
                channel_id,
                payload,
                ..
            } => match self.channels.get_mut(&channel_id) {
                Some(chan) => {
                    if chan.buffer(payload) {
                        self.events.push_back(Event::ChannelReadable { id: channel_id });
                    }
                }
                None => {
                    debug!(self.log, "data received for unknown channel {id}", id = channel_id);
                }
            },
            Chunk::Ack { .. } => {}
        }
    }

    //
    // Message dispatch
    //

    /// Register an extension handler for `msg_id`. Handlers run in
    /// registration order after the defaults; the first to return true
    /// claims the message.
    pub fn add_msg_handler<F>(&mut self, msg_id: &str, handler: F)
    where
        F: FnMut(&mut Session, &str, &[u8]) -> bool + 'static,
    {
        self.handlers.push(Registration {
            msg_id: msg_id.to_string(),
            handler: Handler::Ext(Box::new(handler)),
        });
    }

    /// Remove every extension handler registered for `msg_id`. The default
    /// handlers are permanent.
    pub fn remove_msg_handlers(&mut self, msg_id: &str) {
        self.handlers.retain(|reg| match reg.handler {
            Handler::Ext(_) => !reg.msg_id.eq_ignore_ascii_case(msg_id),
            Handler::Builtin(_) => true,
        });
    }

    /// Queue a control message. The chunk id is assigned when the chunk is
    /// serialized.
    pub fn send_msg(&mut self, msg_id: &str, body: Bytes) {
        self.enqueue_chunk(Chunk::Message {
            chunk_id: 0,
            ack_id: 0,
            msg_id: msg_id.to_string(),
            body,
        });
    }

    fn dispatch_message(&mut self, now: u64, msg_id: &str, body: &[u8]) {
        trace!(self.log, "got message"; "type" => msg_id, "len" => body.len());

        // The handler list is moved out so handlers may mutate the session;
        // re-entrant registrations are merged back afterwards.
        let mut handlers = mem::replace(&mut self.handlers, Vec::new());
        let mut found = false;
        for reg in &mut handlers {
            if !reg.msg_id.eq_ignore_ascii_case(msg_id) {
                continue;
            }
            found = true;
            let handled = match reg.handler {
                Handler::Builtin(builtin) => self.handle_builtin(builtin, now, msg_id, body),
                Handler::Ext(ref mut cb) => cb(self, msg_id, body),
            };
            if handled {
                break;
            }
        }
        let mut added = mem::replace(&mut self.handlers, handlers);
        self.handlers.append(&mut added);

        if !found {
            debug!(self.log, "unhandled message type {ty}", ty = msg_id);
        }
    }

    fn handle_builtin(&mut self, builtin: Builtin, now: u64, msg_id: &str, body: &[u8]) -> bool {
        let result = match builtin {
            Builtin::Authenticated => self.on_authenticated(now, body),
            Builtin::EchoRq => self.on_echo_rq(),
            Builtin::EchoRp => Ok(true),
            Builtin::Error => self.on_error(body),
            Builtin::ListenRq => self.on_listen_rq(body),
            Builtin::Lower => self.on_lower(body),
            Builtin::PleaseInit => self.on_please_init(now, body),
            Builtin::RaiseRp => self.on_raise_rp(body),
            Builtin::Ready => self.on_ready(),
            Builtin::Stop => self.on_stop(body),
            Builtin::SysMsg => self.on_sysmsg(body),
            Builtin::UnlistenRq => self.on_unlisten_rq(body),
        };
        match result {
            Ok(handled) => handled,
            Err(e) => {
                warn!(self.log, "malformed {ty} message: {err}", ty = msg_id, err = e.to_string());
                self.protocol_fatal();
                true
            }
        }
    }

    //
    // Default handlers
    //

    fn on_please_init(&mut self, now: u64, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        match reader.string_opt("cid")? {
            Some(ref cid) if *cid == self.config.correlation_id => {}
            other => {
                warn!(self.log, "incorrect correlation id in please-init";
                      "cid" => format!("{:?}", other));
                return Ok(false);
            }
        }

        let body = MsgBuilder::new()
            .string("ipaddress", &self.host_ip)
            .string("hostaddress", &self.host_name)
            .string("capID", self.cap_id.as_ref().map_or("", |s| s.as_str()))
            .string("type", &self.config.client_type)
            .long("t1", now as i64)
            .finish();
        self.send_msg(message::START, body);
        if self.state == State::Initializing {
            self.state = State::Starting;
        }
        Ok(true)
    }

    fn on_authenticated(&mut self, now: u64, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let allow_reconnection = reader.boolean("allowAutoReconnection")?;
        let cap_id = reader.string("capID")?;
        self.lost_contact_timeout = reader.long("lostContactTimeout")? as u64 * 1000;
        self.disconnected_timeout = reader.long("disconnectedTimeout")? as u64 * 1000;

        match self.cap_id {
            Some(ref existing) if *existing != cap_id => {
                warn!(self.log, "authenticated capID does not match expected value";
                      "got" => cap_id.as_str(), "expected" => existing.as_str());
            }
            _ => self.cap_id = Some(cap_id),
        }

        self.reconnect_secret = None;
        if allow_reconnection {
            match reader.string_opt("reconnectSecret")? {
                Some(secret) => self.reconnect_secret = Some(secret),
                None => {
                    warn!(self.log, "automatic reconnect disabled: no reconnect secret");
                }
            }
        }

        // Kick off echo and lost-contact watchdogs.
        self.arm_timeouts(now);

        if self.state == State::Starting {
            self.state = State::Authenticated;
        }
        Ok(true)
    }

    fn on_ready(&mut self) -> Result<bool, MsgError> {
        info!(self.log, "TUNNEL READY");
        if self.state == State::Authenticated {
            self.state = State::Ready;
        }
        self.events.push_back(Event::Ready);
        Ok(true)
    }

    fn on_echo_rq(&mut self) -> Result<bool, MsgError> {
        self.send_msg(message::ECHO_RP, Bytes::new());
        Ok(true)
    }

    fn on_stop(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let reason = reader.string_opt("reason")?;
        warn!(self.log, "TUNNEL STOPPED: {reason}",
              reason = reason.as_ref().map_or("", |s| s.as_str()));

        // The reconnect secret is void after a stop.
        self.reconnect_secret = None;
        let _ = self.disconnect_inner(reason, true, true);
        self.state = State::Stopped;
        Ok(true)
    }

    fn on_sysmsg(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let msg = reader
            .string_opt("msg")?
            .unwrap_or_else(|| "<Invalid Message>".to_string());
        info!(self.log, "TUNNEL SYSTEM MESSAGE: {msg}", msg = msg.clone());
        self.events.push_back(Event::SystemMessage { msg });
        Ok(true)
    }

    fn on_error(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let msg = reader
            .string_opt("msg")?
            .unwrap_or_else(|| "<Invalid Error>".to_string());
        warn!(self.log, "TUNNEL ERROR: {msg}", msg = msg.clone());
        self.events.push_back(Event::ErrorMessage { msg });
        Ok(true)
    }

    fn on_listen_rq(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let client_port = reader.int("clientPort")?;
        let server_host = reader.string("serverHost")?;
        let server_port = reader.int("serverPort")?;
        let port_name = reader.string("portName")?;
        let max_connections = reader.int("maxConnections")?;
        let cid = reader.int("cid")?;
        // clientHost is often absent; bind loopback then.
        let bind_addr = reader
            .string_opt("clientHost")?
            .unwrap_or_else(|| "127.0.0.1".to_string());

        if client_port < -1 || client_port > 65535 {
            warn!(self.log, "listen-rq with impossible clientPort";
                  "port" => client_port);
            self.send_listen_problem(cid, "Invalid clientPort");
            return Ok(true);
        }
        let port = if client_port == -1 { 0 } else { client_port as u16 };

        if port_name.len() > MAX_PORT_NAME_LEN {
            warn!(self.log, "listen-rq with overlong portName";
                  "portName" => port_name.as_str());
            self.send_listen_problem(cid, "Invalid portName");
            return Ok(true);
        }
        if self.listeners.contains_key(&port_name)
            || self
                .pending_listeners
                .iter()
                .any(|(_, p)| p.port_name == port_name)
        {
            warn!(self.log, "listen-rq for duplicate portName";
                  "portName" => port_name.as_str());
            self.send_listen_problem(cid, "Duplicate portName");
            return Ok(true);
        }

        debug!(self.log, "new listener requested";
               "portName" => port_name.as_str(), "bind" => bind_addr.as_str(), "port" => port,
               "server" => format!("{}:{}", server_host, server_port));

        let single_use = max_connections == 1;
        let entry = self.pending_listeners.insert(PendingListener {
            port_name: port_name.clone(),
            bind_addr: bind_addr.clone(),
            port,
            single_use,
            cid,
        });
        self.events.push_back(Event::ListenRequested {
            listener: ListenerHandle(entry),
            port_name,
            bind_addr,
            port,
            single_use,
        });
        Ok(true)
    }

    fn send_listen_problem(&mut self, cid: i32, problem: &str) {
        let body = MsgBuilder::new()
            .int("cid", cid)
            .error("problem", problem)
            .finish();
        self.send_msg(message::LISTEN_RP, body);
    }

    /// Complete a `ListenRequested` event: the embedder bound the socket
    /// and accepted the listener. Registers it and reports the actually
    /// bound port to the server.
    pub fn listener_ready(
        &mut self,
        handle: ListenerHandle,
        bound_port: u16,
    ) -> Result<(), TunnelError> {
        if !self.pending_listeners.contains(handle.0) {
            return Err(TunnelError::InvalidListener);
        }
        let pending = self.pending_listeners.remove(handle.0);
        info!(self.log, "creating new listener";
              "portName" => pending.port_name.as_str(), "bind" => pending.bind_addr.as_str(),
              "requested" => pending.port, "port" => bound_port);

        let body = MsgBuilder::new()
            .int("cid", pending.cid)
            .string("portName", &pending.port_name)
            .string("clientHost", &pending.bind_addr)
            .int("clientPort", i32::from(bound_port))
            .finish();
        self.send_msg(message::LISTEN_RP, body);

        self.listeners.insert(
            pending.port_name.clone(),
            Listener {
                port_name: pending.port_name,
                bind_addr: pending.bind_addr,
                port: bound_port,
                single_use: pending.single_use,
            },
        );
        Ok(())
    }

    /// Complete a `ListenRequested` event negatively: bind failure or owner
    /// rejection. `problem` travels to the server in `listen-rp` (owner
    /// rejections conventionally pass `"User Rejected"`).
    pub fn listener_rejected(
        &mut self,
        handle: ListenerHandle,
        problem: &str,
    ) -> Result<(), TunnelError> {
        if !self.pending_listeners.contains(handle.0) {
            return Err(TunnelError::InvalidListener);
        }
        let pending = self.pending_listeners.remove(handle.0);
        warn!(self.log, "rejecting new listener";
              "portName" => pending.port_name.as_str(), "problem" => problem);
        self.send_listen_problem(pending.cid, problem);
        Ok(())
    }

    fn on_unlisten_rq(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let port_name = reader.string("portName")?;
        if self.close_listener(&port_name).is_err() {
            let body = MsgBuilder::new().error("problem", "Invalid portName").finish();
            self.send_msg(message::UNLISTEN_RP, body);
        }
        Ok(true)
    }

    fn on_raise_rp(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let channel_id = reader.int("chanID")? as u32;
        let port_name = match self.channels.get(&channel_id) {
            Some(chan) => chan.port_name.clone(),
            None => {
                warn!(self.log, "invalid channel {id} in raise reply", id = channel_id);
                return Ok(false);
            }
        };

        match reader.error_opt("problem")? {
            Some(problem) => {
                warn!(self.log, "error raising channel {id}: {problem}",
                      id = channel_id, problem = problem.clone());
                let _ = self.close_channel(channel_id);
            }
            None => {
                if let Some(chan) = self.channels.get_mut(&channel_id) {
                    chan.state = ChannelState::Raised;
                }
                self.events.push_back(Event::ChannelRaised {
                    id: channel_id,
                    port_name,
                });
            }
        }
        Ok(true)
    }

    fn on_lower(&mut self, body: &[u8]) -> Result<bool, MsgError> {
        let reader = MsgReader::parse(body)?;
        let channel_id = reader.int("chanID")? as u32;
        debug!(self.log, "server requested channel close"; "channel" => channel_id);
        if let Err(e) = self.close_channel(channel_id) {
            warn!(self.log, "error closing channel {id}: {err}", id = channel_id, err = e.to_string());
        }
        Ok(true)
    }

    //
    // Listener and channel lifecycle
    //

    /// Register a channel for a connection the embedder just accepted on
    /// the listener named `port_name`, and raise it with the server. Bytes
    /// must not be written until `ChannelRaised` arrives.
    pub fn open_channel(&mut self, port_name: &str) -> Result<u32, TunnelError> {
        if !self.listeners.contains_key(port_name) {
            return Err(TunnelError::InvalidListener);
        }
        self.max_channel_id += 1;
        let channel_id = self.max_channel_id;
        info!(self.log, "creating new channel {id} to listener {name}",
              id = channel_id, name = port_name);

        self.channels
            .insert(channel_id, Channel::new(port_name.to_string()));

        let body = MsgBuilder::new()
            .int("chanID", channel_id as i32)
            .string("portName", port_name)
            .finish();
        self.send_msg(message::RAISE_RQ, body);
        Ok(channel_id)
    }

    /// Close a channel. If its listener is single-use the listener is
    /// closed along with it; otherwise the server is told with `lower`.
    pub fn close_channel(&mut self, channel_id: u32) -> Result<(), TunnelError> {
        let port_name = match self.channels.get(&channel_id) {
            Some(chan) => chan.port_name.clone(),
            None => return Err(TunnelError::InvalidChannelId),
        };

        if self
            .listeners
            .get(&port_name)
            .map_or(false, |l| l.single_use)
        {
            info!(self.log, "closing single-use listener {name} after channel {id} disconnect",
                  name = port_name.clone(), id = channel_id);
            // Re-enters below with the listener already gone.
            return self.close_listener(&port_name);
        }

        self.channels.remove(&channel_id);
        self.events.push_back(Event::ChannelClosed {
            id: channel_id,
            port_name,
        });

        let body = MsgBuilder::new().int("chanID", channel_id as i32).finish();
        self.send_msg(message::LOWER, body);
        Ok(())
    }

    /// Close a listener and every channel belonging to it, and tell the
    /// server with `unlisten-rp`.
    pub fn close_listener(&mut self, port_name: &str) -> Result<(), TunnelError> {
        let listener = match self.listeners.remove(port_name) {
            Some(listener) => listener,
            None => return Err(TunnelError::InvalidListener),
        };
        self.events.push_back(Event::ListenerClosed {
            port_name: listener.port_name.clone(),
            port: listener.port,
        });

        // Sent in any case of closing; it is only sometimes a reply to an
        // unlisten-rq.
        let body = MsgBuilder::new().string("portName", port_name).finish();
        self.send_msg(message::UNLISTEN_RP, body);

        let ids: Vec<u32> = self
            .channels
            .iter()
            .filter(|&(_, chan)| chan.port_name == port_name)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let _ = self.close_channel(id);
        }
        Ok(())
    }

    //
    // Channel byte pumps
    //

    /// Feed bytes read from a channel's local socket toward the server.
    /// Splits into data chunks no larger than the protocol's 10 KiB bound;
    /// flow control may delay serialization but never rejects the write.
    pub fn write(&mut self, channel_id: u32, data: &[u8]) -> Result<usize, WriteError> {
        match self.channels.get(&channel_id) {
            None => return Err(WriteError::UnknownChannel),
            Some(chan) => {
                if chan.state != ChannelState::Raised {
                    return Err(WriteError::NotRaised);
                }
            }
        }
        for piece in data.chunks(MAX_DATA_LEN) {
            let chunk = Chunk::Data {
                chunk_id: 0,
                ack_id: 0,
                channel_id,
                payload: piece.to_vec().into(),
            };
            self.enqueue_chunk(chunk);
        }
        Ok(data.len())
    }

    /// Drain buffered inbound bytes for a channel into `buf`, in arrival
    /// order.
    pub fn read(&mut self, channel_id: u32, buf: &mut [u8]) -> Result<usize, ReadError> {
        match self.channels.get_mut(&channel_id) {
            None => Err(ReadError::UnknownChannel),
            Some(chan) => chan.read(buf),
        }
    }

    //
    // Sequencing helpers
    //

    fn enqueue_chunk(&mut self, chunk: Chunk) {
        self.queue_out.push_back(chunk);
        self.fire_send_needed();
    }

    fn fire_send_needed(&mut self) {
        if self.send_needed() {
            self.events.push_back(Event::SendNeeded);
        }
    }

    fn update_flow_control(&mut self) {
        let unacked = self.last_chunk_id_sent.saturating_sub(self.last_chunk_ack_seen);
        if unacked > START_FLOW_CONTROL && !self.flow_stopped {
            debug!(self.log, "starting flow control"; "unacked" => unacked);
            self.flow_stopped = true;
        } else if unacked < END_FLOW_CONTROL && self.flow_stopped {
            debug!(self.log, "ending flow control");
            self.flow_stopped = false;
            self.fire_send_needed();
        }
    }

    //
    // Timers
    //

    fn stop_timeouts(&mut self) {
        self.io.push_back(Io::TimerStop {
            timer: Timer::LostContact,
        });
        self.io.push_back(Io::TimerStop { timer: Timer::Echo });
    }

    /// Cancel and, if the server gave us a lost-contact budget, re-arm both
    /// watchdogs. The echo period is a third of the lost-contact timeout.
    fn arm_timeouts(&mut self, now: u64) {
        self.stop_timeouts();
        if self.lost_contact_timeout > 0 {
            self.io.push_back(Io::TimerStart {
                timer: Timer::LostContact,
                time: now + self.lost_contact_timeout,
            });
            self.io.push_back(Io::TimerStart {
                timer: Timer::Echo,
                time: now + self.lost_contact_timeout / 3,
            });
        }
    }

    /// Handle a timer expiring.
    pub fn timeout(&mut self, now: u64, timer: Timer) {
        trace!(self.log, "timeout"; "timer" => timer);
        match timer {
            Timer::Echo => {
                let body = MsgBuilder::new().long("now", now as i64).finish();
                self.send_msg(message::ECHO_RQ, body);
                if self.lost_contact_timeout > 0 {
                    self.io.push_back(Io::TimerStart {
                        timer: Timer::Echo,
                        time: now + self.lost_contact_timeout / 3,
                    });
                }
            }
            Timer::LostContact => {
                self.transport_error("Client disconnected following no activity.");
            }
        }
    }
}
