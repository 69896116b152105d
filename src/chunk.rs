//! Wire codec for the three chunk kinds sharing the tunnel byte stream.
//!
//! The grammar is ASCII with uppercase hex numbers (lowercase accepted on
//! read) and `;` as a hard field delimiter; byte runs are length-prefixed
//! and copied verbatim:
//!
//! ```text
//! ACK     := "A;" hex(ackId) ";"
//! MESSAGE := "M;" hex(chunkId) ";" hex?(ackId) ";" hex(hdrLen) ";" hdr ";" hex(bodyLen) ";" body ";"
//! DATA    := "D;" hex(chunkId) ";" hex?(ackId) ";" hex(channelId) ";" hex(payloadLen) ";" payload ";"
//! ```
//!
//! `hex?` is empty when zero. A message header is itself message-codec text
//! carrying `messageType=S:<base64>`. When the stream is a live POST body
//! each chunk is additionally wrapped in HTTP chunked framing,
//! `hex(len)\r\n<chunk>\r\n`.

use bytes::Bytes;

use coding::{self, FieldError};
use message::{self, MsgBuilder, MsgError};

const TYPE_ACK: u8 = b'A';
const TYPE_DATA: u8 = b'D';
const TYPE_MESSAGE: u8 = b'M';

/// Sanity bound on any declared length. Data payloads are capped far lower
/// by the protocol; a length beyond this is corruption, not data, and must
/// not leave the parser waiting for megabytes that will never arrive.
const MAX_DECLARED_LEN: usize = 1 << 20;

/// The unit of transport: a bare acknowledgement, a control message, or
/// application bytes for one channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Chunk {
    Ack {
        ack_id: u32,
    },
    Message {
        chunk_id: u32,
        ack_id: u32,
        msg_id: String,
        body: Bytes,
    },
    Data {
        chunk_id: u32,
        ack_id: u32,
        channel_id: u32,
        payload: Bytes,
    },
}

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum ChunkDecodeError {
    #[fail(display = "invalid hex digit 0x{:02x}", _0)]
    InvalidHex(u8),
    #[fail(display = "hex field too long")]
    FieldTooLong,
    #[fail(display = "expected field delimiter, found 0x{:02x}", _0)]
    BadDelimiter(u8),
    #[fail(display = "unknown chunk type 0x{:02x}", _0)]
    UnknownType(u8),
    #[fail(display = "declared length {} is impossible", _0)]
    ImpossibleLength(usize),
    #[fail(display = "malformed http chunk framing")]
    BadFraming,
    #[fail(display = "malformed message header: {}", _0)]
    BadHeader(MsgError),
}

impl From<FieldError> for ChunkDecodeError {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::InvalidHex(d) => ChunkDecodeError::InvalidHex(d),
            FieldError::TooLong => ChunkDecodeError::FieldTooLong,
            FieldError::Delimiter(b) => ChunkDecodeError::BadDelimiter(b),
        }
    }
}

/// Unwrap `Ok(Some(..))`, propagating errors and turning "not enough
/// buffered bytes" into an early `Ok(None)` for the caller to retry later.
macro_rules! try_field {
    ($e:expr) => {
        match $e? {
            Some(x) => x,
            None => return Ok(None),
        }
    };
}

impl Chunk {
    /// Sequence number, zero for acks (which are never sequenced) and for
    /// chunks not yet serialized.
    pub fn chunk_id(&self) -> u32 {
        match *self {
            Chunk::Ack { .. } => 0,
            Chunk::Message { chunk_id, .. } | Chunk::Data { chunk_id, .. } => chunk_id,
        }
    }

    pub fn ack_id(&self) -> u32 {
        match *self {
            Chunk::Ack { ack_id }
            | Chunk::Message { ack_id, .. }
            | Chunk::Data { ack_id, .. } => ack_id,
        }
    }

    pub fn is_ack(&self) -> bool {
        match *self {
            Chunk::Ack { .. } => true,
            _ => false,
        }
    }

    pub fn is_data(&self) -> bool {
        match *self {
            Chunk::Data { .. } => true,
            _ => false,
        }
    }

    /// Assign the sequence number. No-op on acks.
    pub fn set_chunk_id(&mut self, id: u32) {
        match *self {
            Chunk::Ack { .. } => {}
            Chunk::Message {
                ref mut chunk_id, ..
            }
            | Chunk::Data {
                ref mut chunk_id, ..
            } => *chunk_id = id,
        }
    }

    pub fn set_ack_id(&mut self, id: u32) {
        match *self {
            Chunk::Ack { ref mut ack_id }
            | Chunk::Message { ref mut ack_id, .. }
            | Chunk::Data { ref mut ack_id, .. } => *ack_id = id,
        }
    }

    /// Serialize into `out`, wrapping in HTTP chunked framing when
    /// requested. Always emits the full declared lengths.
    pub fn encode(&self, http_chunked: bool, out: &mut Vec<u8>) {
        if http_chunked {
            let mut inner = Vec::new();
            self.encode_bare(&mut inner);
            coding::write_hex(out, inner.len() as u32);
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&inner);
            out.extend_from_slice(b"\r\n");
        } else {
            self.encode_bare(out);
        }
    }

    fn encode_bare(&self, out: &mut Vec<u8>) {
        match *self {
            Chunk::Ack { ack_id } => {
                out.push(TYPE_ACK);
                out.push(b';');
                coding::write_hex(out, ack_id);
                out.push(b';');
            }
            Chunk::Message {
                chunk_id,
                ack_id,
                ref msg_id,
                ref body,
            } => {
                let hdr = MsgBuilder::new().string("messageType", msg_id).finish();
                out.push(TYPE_MESSAGE);
                out.push(b';');
                coding::write_hex(out, chunk_id);
                out.push(b';');
                coding::write_hex_opt(out, ack_id);
                out.push(b';');
                coding::write_hex(out, hdr.len() as u32);
                out.push(b';');
                out.extend_from_slice(&hdr);
                out.push(b';');
                coding::write_hex(out, body.len() as u32);
                out.push(b';');
                out.extend_from_slice(body);
                out.push(b';');
            }
            Chunk::Data {
                chunk_id,
                ack_id,
                channel_id,
                ref payload,
            } => {
                out.push(TYPE_DATA);
                out.push(b';');
                coding::write_hex(out, chunk_id);
                out.push(b';');
                coding::write_hex_opt(out, ack_id);
                out.push(b';');
                coding::write_hex(out, channel_id);
                out.push(b';');
                coding::write_hex(out, payload.len() as u32);
                out.push(b';');
                out.extend_from_slice(payload);
                out.push(b';');
            }
        }
    }

    /// Try to decode one whole chunk from the front of `buf`.
    ///
    /// Returns the chunk and the number of bytes consumed, or `Ok(None)`
    /// when the buffer holds only a partial chunk (the caller keeps the
    /// bytes and retries after the next read). Malformed input fails
    /// closed; the session treats any such error as fatal.
    pub fn decode(
        buf: &[u8],
        http_chunked: bool,
    ) -> Result<Option<(Chunk, usize)>, ChunkDecodeError> {
        if !http_chunked {
            return Self::decode_bare(buf);
        }

        let mut idx = 0;
        let declared = try_field!(coding::read_hex(buf, &mut idx, b'\r')) as usize;
        if declared == 0 {
            // The terminal chunk of a closing response body. The transport
            // reports the close itself; the parser just stops consuming.
            return Ok(None);
        }
        if declared > MAX_DECLARED_LEN {
            return Err(ChunkDecodeError::ImpossibleLength(declared));
        }
        if buf.len() < idx + 1 + declared + 2 {
            return Ok(None);
        }
        if buf[idx] != b'\n' {
            return Err(ChunkDecodeError::BadFraming);
        }
        idx += 1;
        let inner = &buf[idx..idx + declared];
        if buf[idx + declared] != b'\r' || buf[idx + declared + 1] != b'\n' {
            return Err(ChunkDecodeError::BadFraming);
        }
        match Self::decode_bare(inner)? {
            Some((chunk, used)) if used == declared => Ok(Some((chunk, idx + declared + 2))),
            // The frame is complete, so a short or trailing-garbage parse
            // cannot be cured by more input.
            _ => Err(ChunkDecodeError::BadFraming),
        }
    }

    fn decode_bare(buf: &[u8]) -> Result<Option<(Chunk, usize)>, ChunkDecodeError> {
        let mut idx = 0;
        let ty = try_field!(coding::read_bytes(buf, &mut idx, 1, b';'))[0];
        match ty {
            TYPE_ACK => {
                let ack_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                Ok(Some((Chunk::Ack { ack_id }, idx)))
            }
            TYPE_MESSAGE => {
                let chunk_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                let ack_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                let hdr_len = try_field!(coding::read_hex(buf, &mut idx, b';')) as usize;
                if hdr_len > MAX_DECLARED_LEN {
                    return Err(ChunkDecodeError::ImpossibleLength(hdr_len));
                }
                let hdr = try_field!(coding::read_bytes(buf, &mut idx, hdr_len, b';'));
                let body_len = try_field!(coding::read_hex(buf, &mut idx, b';')) as usize;
                if body_len > MAX_DECLARED_LEN {
                    return Err(ChunkDecodeError::ImpossibleLength(body_len));
                }
                let msg_id = message::message_type(hdr).map_err(ChunkDecodeError::BadHeader)?;
                let body = try_field!(coding::read_bytes(buf, &mut idx, body_len, b';'));
                Ok(Some((
                    Chunk::Message {
                        chunk_id,
                        ack_id,
                        msg_id,
                        body: body.to_vec().into(),
                    },
                    idx,
                )))
            }
            TYPE_DATA => {
                let chunk_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                let ack_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                let channel_id = try_field!(coding::read_hex(buf, &mut idx, b';'));
                let payload_len = try_field!(coding::read_hex(buf, &mut idx, b';')) as usize;
                if payload_len > MAX_DECLARED_LEN {
                    return Err(ChunkDecodeError::ImpossibleLength(payload_len));
                }
                let payload = try_field!(coding::read_bytes(buf, &mut idx, payload_len, b';'));
                Ok(Some((
                    Chunk::Data {
                        chunk_id,
                        ack_id,
                        channel_id,
                        payload: payload.to_vec().into(),
                    },
                    idx,
                )))
            }
            other => Err(ChunkDecodeError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(chunk: Chunk, http_chunked: bool) {
        let mut wire = Vec::new();
        chunk.encode(http_chunked, &mut wire);
        let (decoded, used) = Chunk::decode(&wire, http_chunked).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn roundtrip_all_kinds() {
        for &chunked in &[false, true] {
            roundtrip(Chunk::Ack { ack_id: 4 }, chunked);
            roundtrip(
                Chunk::Message {
                    chunk_id: 1,
                    ack_id: 0,
                    msg_id: "echo-rq".to_string(),
                    body: Bytes::from(&b"now=L:123|"[..]),
                },
                chunked,
            );
            roundtrip(
                Chunk::Data {
                    chunk_id: 7,
                    ack_id: 3,
                    channel_id: 2,
                    payload: Bytes::from(&b"hello; \0world"[..]),
                },
                chunked,
            );
        }
    }

    #[test]
    fn roundtrip_large_payload() {
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        roundtrip(
            Chunk::Data {
                chunk_id: 0xABCDEF,
                ack_id: 0xF00D,
                channel_id: 9,
                payload: payload.into(),
            },
            true,
        );
    }

    #[test]
    fn ack_wire_form() {
        let mut wire = Vec::new();
        Chunk::Ack { ack_id: 0x1F }.encode(false, &mut wire);
        assert_eq!(wire, b"A;1F;");
    }

    #[test]
    fn zero_ack_field_is_empty() {
        let mut wire = Vec::new();
        Chunk::Data {
            chunk_id: 2,
            ack_id: 0,
            channel_id: 1,
            payload: Bytes::from(&b"x"[..]),
        }.encode(false, &mut wire);
        assert_eq!(wire, b"D;2;;1;1;x;");
    }

    #[test]
    fn lowercase_hex_accepted() {
        let (chunk, _) = Chunk::decode(b"A;ff;", false).unwrap().unwrap();
        assert_eq!(chunk, Chunk::Ack { ack_id: 0xFF });
    }

    #[test]
    fn partial_input_resumes() {
        let mut wire = Vec::new();
        Chunk::Data {
            chunk_id: 5,
            ack_id: 2,
            channel_id: 1,
            payload: Bytes::from(&b"abcdef"[..]),
        }.encode(false, &mut wire);
        for cut in 0..wire.len() {
            assert_matches!(Chunk::decode(&wire[..cut], false), Ok(None));
        }
        assert_matches!(Chunk::decode(&wire, false), Ok(Some(_)));
    }

    #[test]
    fn consecutive_chunks_report_consumed() {
        let mut wire = Vec::new();
        Chunk::Ack { ack_id: 1 }.encode(false, &mut wire);
        let first_len = wire.len();
        Chunk::Ack { ack_id: 2 }.encode(false, &mut wire);
        let (c, used) = Chunk::decode(&wire, false).unwrap().unwrap();
        assert_eq!(c, Chunk::Ack { ack_id: 1 });
        assert_eq!(used, first_len);
        let (c, _) = Chunk::decode(&wire[used..], false).unwrap().unwrap();
        assert_eq!(c, Chunk::Ack { ack_id: 2 });
    }

    #[test]
    fn unknown_type_fails() {
        assert_matches!(
            Chunk::decode(b"Q;1;", false),
            Err(ChunkDecodeError::UnknownType(b'Q'))
        );
    }

    #[test]
    fn bad_hex_fails() {
        assert_matches!(
            Chunk::decode(b"A;zz;", false),
            Err(ChunkDecodeError::InvalidHex(b'z'))
        );
    }

    #[test]
    fn impossible_length_fails() {
        assert_matches!(
            Chunk::decode(b"D;1;;1;FFFFFFF;", false),
            Err(ChunkDecodeError::ImpossibleLength(_))
        );
    }

    #[test]
    fn header_without_message_type_fails() {
        // hdr is "x=I:1|" (6 bytes): a valid message body with no
        // messageType key.
        assert_matches!(
            Chunk::decode(b"M;1;;6;x=I:1|;0;;", false),
            Err(ChunkDecodeError::BadHeader(_))
        );
    }

    #[test]
    fn http_framing_mismatch_fails() {
        let mut wire = Vec::new();
        Chunk::Ack { ack_id: 1 }.encode(true, &mut wire);
        // Corrupt the trailing CRLF.
        let len = wire.len();
        wire[len - 2] = b'X';
        assert_matches!(
            Chunk::decode(&wire, true),
            Err(ChunkDecodeError::BadFraming)
        );
    }

    #[test]
    fn http_terminal_chunk_stalls() {
        // `0\r\n\r\n` closes a chunked response body; the close itself is
        // the transport's news, not a tunnel chunk.
        assert_matches!(Chunk::decode(b"0\r\n\r\n", true), Ok(None));
    }

    #[test]
    fn http_framing_partial() {
        let mut wire = Vec::new();
        Chunk::Ack { ack_id: 9 }.encode(true, &mut wire);
        for cut in 0..wire.len() {
            assert_matches!(Chunk::decode(&wire[..cut], true), Ok(None));
        }
    }
}
