//! Typed key/value codec for the bodies of message chunks.
//!
//! Bodies are `key=<T>:<value>|` repeated, where `<T>` is a one-character
//! type tag:
//!
//! - `S` — UTF-8 string, base64-encoded on the wire
//! - `E` — error string, base64-encoded (tagged distinctly for clarity)
//! - `I` — 32-bit signed integer, decimal
//! - `L` — 64-bit signed integer, decimal
//! - `B` — boolean; `1`, `true` and `yes` (case-insensitive) decode true
//!
//! Keys are ASCII and unique within a body. Read order is free; write order
//! follows the builder calls. Reading is strictly fail-closed: a missing
//! key, wrong tag, malformed base64 or malformed number is an error.

use std::str;

use base64;
use bytes::Bytes;
use fnv::FnvHashSet;

/* Client-originated message types. */
pub const INIT: &'static str = "init";
pub const START: &'static str = "start";
pub const LISTEN_RP: &'static str = "listen-rp";
pub const UNLISTEN_RP: &'static str = "unlisten-rp";
pub const RAISE_RQ: &'static str = "raise-rq";
pub const CLIENT_ERROR: &'static str = "client-error";

/* Server-originated message types. */
pub const PLEASE_INIT: &'static str = "please-init";
pub const AUTHENTICATED: &'static str = "authenticated";
pub const READY: &'static str = "ready";
pub const STOP: &'static str = "stop";
pub const SYSMSG: &'static str = "sysmsg";
pub const ERROR: &'static str = "error";
pub const LISTEN_RQ: &'static str = "listen-rq";
pub const UNLISTEN_RQ: &'static str = "unlisten-rq";
pub const RAISE_RP: &'static str = "raise-rp";

/* Types travelling in either direction. */
pub const LOWER: &'static str = "lower";
pub const ECHO_RQ: &'static str = "echo-rq";
pub const ECHO_RP: &'static str = "echo-rp";

/* Reserved types: accepted and logged, but nothing handles them by
 * default. */
pub const PLEASE_AUTH: &'static str = "please-auth";
pub const AUTH_RQ: &'static str = "auth_rq";
pub const AUTH_RP: &'static str = "auth_rp";
pub const TID_RQ: &'static str = "tid-rq";
pub const TGS_REQ: &'static str = "tgs-req";
pub const TGS_REP: &'static str = "tgs-rep";
pub const OPENURL_RQ: &'static str = "openurl-rq";
pub const OPENURL_RP: &'static str = "openurl-rp";
pub const SECURITY_MSG: &'static str = "security-msg";
pub const PAC_UPDATE: &'static str = "pac-update";
pub const PAC_REPLY: &'static str = "pac-reply";

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum MsgError {
    #[fail(display = "message body is not well-formed key=type:value text")]
    Malformed,
    #[fail(display = "duplicate key \"{}\"", _0)]
    DuplicateKey(String),
    #[fail(display = "missing key \"{}\"", _0)]
    MissingKey(String),
    #[fail(display = "key \"{}\" has type tag '{}', expected '{}'", _0, _1, _2)]
    WrongType(String, char, char),
    #[fail(display = "key \"{}\" holds malformed base64", _0)]
    BadBase64(String),
    #[fail(display = "key \"{}\" does not decode to UTF-8", _0)]
    BadUtf8(String),
    #[fail(display = "key \"{}\" holds a malformed integer", _0)]
    BadInt(String),
}

/// Composes a message body, one `key=<T>:<value>|` element per call.
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    pub fn new() -> Self {
        MsgBuilder { buf: Vec::new() }
    }

    fn pair(mut self, key: &str, tag: u8, value: &str) -> Self {
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.push(b'=');
        self.buf.push(tag);
        self.buf.push(b':');
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(b'|');
        self
    }

    pub fn string(self, key: &str, value: &str) -> Self {
        let encoded = base64::encode(value.as_bytes());
        self.pair(key, b'S', &encoded)
    }

    pub fn error(self, key: &str, value: &str) -> Self {
        let encoded = base64::encode(value.as_bytes());
        self.pair(key, b'E', &encoded)
    }

    pub fn int(self, key: &str, value: i32) -> Self {
        self.pair(key, b'I', &value.to_string())
    }

    pub fn long(self, key: &str, value: i64) -> Self {
        self.pair(key, b'L', &value.to_string())
    }

    pub fn boolean(self, key: &str, value: bool) -> Self {
        self.pair(key, b'B', if value { "true" } else { "false" })
    }

    pub fn finish(self) -> Bytes {
        self.buf.into()
    }
}

/// Parsed view of a message body. Values are decoded lazily by the typed
/// getters; `*_opt` variants exist for keys the protocol makes optional.
#[derive(Debug)]
pub struct MsgReader<'a> {
    pairs: Vec<(&'a str, char, &'a str)>,
}

impl<'a> MsgReader<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, MsgError> {
        let text = str::from_utf8(body).map_err(|_| MsgError::Malformed)?;
        let mut pairs = Vec::new();
        let mut seen = FnvHashSet::default();
        for element in text.split('|') {
            if element.is_empty() {
                // Every element is '|'-terminated, so the final split is
                // empty on a well-formed body.
                continue;
            }
            let eq = match element.find('=') {
                Some(i) if i > 0 => i,
                _ => return Err(MsgError::Malformed),
            };
            let key = &element[..eq];
            let rest = element[eq + 1..].as_bytes();
            if rest.len() < 2 || !rest[0].is_ascii() || rest[1] != b':' {
                return Err(MsgError::Malformed);
            }
            if !seen.insert(key) {
                return Err(MsgError::DuplicateKey(key.to_string()));
            }
            pairs.push((key, rest[0] as char, &element[eq + 3..]));
        }
        Ok(MsgReader { pairs })
    }

    fn typed(&self, key: &str, tag: char) -> Result<Option<&'a str>, MsgError> {
        for &(k, t, v) in &self.pairs {
            if k == key {
                if t != tag {
                    return Err(MsgError::WrongType(key.to_string(), t, tag));
                }
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn required(&self, key: &str, tag: char) -> Result<&'a str, MsgError> {
        self.typed(key, tag)?
            .ok_or_else(|| MsgError::MissingKey(key.to_string()))
    }

    fn decode_b64(key: &str, value: &str) -> Result<String, MsgError> {
        let raw = base64::decode(value).map_err(|_| MsgError::BadBase64(key.to_string()))?;
        String::from_utf8(raw).map_err(|_| MsgError::BadUtf8(key.to_string()))
    }

    /// Read a required `S` value.
    pub fn string(&self, key: &str) -> Result<String, MsgError> {
        Self::decode_b64(key, self.required(key, 'S')?)
    }

    /// Read an optional `S` value.
    pub fn string_opt(&self, key: &str) -> Result<Option<String>, MsgError> {
        match self.typed(key, 'S')? {
            Some(v) => Self::decode_b64(key, v).map(Some),
            None => Ok(None),
        }
    }

    /// Read a required `E` value.
    pub fn error_str(&self, key: &str) -> Result<String, MsgError> {
        Self::decode_b64(key, self.required(key, 'E')?)
    }

    /// Read an optional `E` value.
    pub fn error_opt(&self, key: &str) -> Result<Option<String>, MsgError> {
        match self.typed(key, 'E')? {
            Some(v) => Self::decode_b64(key, v).map(Some),
            None => Ok(None),
        }
    }

    /// Read a required `I` value.
    pub fn int(&self, key: &str) -> Result<i32, MsgError> {
        self.required(key, 'I')?
            .parse()
            .map_err(|_| MsgError::BadInt(key.to_string()))
    }

    /// Read a required `L` value.
    pub fn long(&self, key: &str) -> Result<i64, MsgError> {
        self.required(key, 'L')?
            .parse()
            .map_err(|_| MsgError::BadInt(key.to_string()))
    }

    /// Read a required `B` value.
    pub fn boolean(&self, key: &str) -> Result<bool, MsgError> {
        let v = self.required(key, 'B')?;
        Ok(v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
    }
}

/// Extract the `messageType` a message chunk header must carry.
pub fn message_type(hdr: &[u8]) -> Result<String, MsgError> {
    MsgReader::parse(hdr)?.string("messageType")
}
