//! Wire framing. Two distinct codecs coexist on the two transports:
//!
//! - [`DiscoveryCodec`] frames UDP discovery datagrams: one code byte
//!   followed by a self-delimited body built from the primitive field
//!   encoding in [`primitive`].
//! - [`SessionFrameCodec`] frames the TCP session stream: a fixed header
//!   (`version | compress_type | packet_type | packet_id | body_size |
//!   packet_size`) followed by the body, optionally snappy-compressed.
//!
//! Both are `tokio_util::codec::{Encoder, Decoder}` impls so they plug into
//! `Framed` the same way `Discv4Codec`/`RLPxCodec` do.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_UDP_DATAGRAM_SIZE: usize = 2048;
pub const MAX_TCP_PACKET_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_TCP_BODY_SIZE_UNCOMPRESSED: usize = 128 * 1024;
pub const DECOMPRESSION_BOMB_THRESHOLD: usize = 5 * 1024 * 1024;

pub const DISCOVERY_CODE_RANGE: std::ops::RangeInclusive<u8> = 0x00..=0x0F;
pub const SESSION_CODE_RANGE: std::ops::RangeInclusive<u8> = 0x10..=0x1F;
pub const HOST_CODE_RANGE: std::ops::RangeInclusive<u8> = 0x20..=0xFF;

pub const KAD_PING: u8 = 0x00;
pub const KAD_PONG: u8 = 0x01;
pub const KAD_FIND_NODE: u8 = 0x02;
pub const KAD_NEIGHBORS: u8 = 0x03;

pub const DISCONNECT: u8 = 0x10;
pub const HANDSHAKE_INIT: u8 = 0x11;
pub const HANDSHAKE_HELLO: u8 = 0x12;
pub const HANDSHAKE_WORLD: u8 = 0x13;
pub const PING: u8 = 0x14;
pub const PONG: u8 = 0x15;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown reserved code {0:#04x}")]
    UnknownCode(u8),
    #[error("datagram too large ({0} bytes, max {MAX_UDP_DATAGRAM_SIZE})")]
    DatagramTooLarge(usize),
    #[error("datagram too short to carry a code byte")]
    DatagramTooShort,
    #[error("unexpected end of buffer while decoding field `{0}`")]
    Truncated(&'static str),
    #[error("string field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("declared packet_size {0} exceeds the {MAX_TCP_PACKET_SIZE} byte limit")]
    BigMessage(usize),
    #[error("declared body_size {0} exceeds the {MAX_TCP_BODY_SIZE_UNCOMPRESSED} byte limit for an uncompressed frame")]
    BodyTooLarge(usize),
    #[error("decompression would expand beyond {DECOMPRESSION_BOMB_THRESHOLD} bytes")]
    DecompressionBomb,
    #[error("snappy decompression failed: {0}")]
    Decompress(#[from] snap::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Primitive field encoding shared by every discovery message body: each
/// field is self-delimited so a decoder never needs an external schema to
/// know where one field ends and the next begins.
pub mod primitive {
    use super::ParseError;
    use bytes::{Buf, BufMut, BytesMut};

    pub fn put_byte(buf: &mut BytesMut, v: u8) {
        buf.put_u8(v);
    }
    pub fn get_byte(buf: &mut impl Buf, field: &'static str) -> Result<u8, ParseError> {
        if !buf.has_remaining() {
            return Err(ParseError::Truncated(field));
        }
        Ok(buf.get_u8())
    }

    pub fn put_short(buf: &mut BytesMut, v: u16) {
        buf.put_u16(v);
    }
    pub fn get_short(buf: &mut impl Buf, field: &'static str) -> Result<u16, ParseError> {
        if buf.remaining() < 2 {
            return Err(ParseError::Truncated(field));
        }
        Ok(buf.get_u16())
    }

    pub fn put_int(buf: &mut BytesMut, v: u32) {
        buf.put_u32(v);
    }
    pub fn get_int(buf: &mut impl Buf, field: &'static str) -> Result<u32, ParseError> {
        if buf.remaining() < 4 {
            return Err(ParseError::Truncated(field));
        }
        Ok(buf.get_u32())
    }

    pub fn put_long(buf: &mut BytesMut, v: u64) {
        buf.put_u64(v);
    }
    pub fn get_long(buf: &mut impl Buf, field: &'static str) -> Result<u64, ParseError> {
        if buf.remaining() < 8 {
            return Err(ParseError::Truncated(field));
        }
        Ok(buf.get_u64())
    }

    pub fn put_bool(buf: &mut BytesMut, v: bool) {
        buf.put_u8(v as u8);
    }
    pub fn get_bool(buf: &mut impl Buf, field: &'static str) -> Result<bool, ParseError> {
        Ok(get_byte(buf, field)? != 0)
    }

    pub fn put_bytes(buf: &mut BytesMut, v: &[u8]) {
        buf.put_u16(v.len() as u16);
        buf.put_slice(v);
    }
    pub fn get_bytes(buf: &mut BytesMut, field: &'static str) -> Result<Vec<u8>, ParseError> {
        let len = get_short(buf, field)? as usize;
        if buf.remaining() < len {
            return Err(ParseError::Truncated(field));
        }
        Ok(buf.split_to(len).to_vec())
    }

    pub fn put_string(buf: &mut BytesMut, v: &str) {
        put_bytes(buf, v.as_bytes());
    }
    pub fn get_string(buf: &mut BytesMut, field: &'static str) -> Result<String, ParseError> {
        let bytes = get_bytes(buf, field)?;
        String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8(field))
    }
}

/// A decoded (or yet-to-be-encoded) discovery datagram: a one-byte code and
/// an opaque body understood by the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryDatagram {
    pub code: u8,
    pub body: BytesMut,
}

pub struct DiscoveryCodec;

impl Decoder for DiscoveryCodec {
    type Item = DiscoveryDatagram;
    type Error = ParseError;

    /// Datagrams arrive whole from the UDP socket (one `recv_from` call is
    /// handed to this decoder as a single chunk), so there is no partial-read
    /// bookkeeping here the way there is for the streamed TCP codec.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() > MAX_UDP_DATAGRAM_SIZE || src.len() <= 1 {
            return Err(ParseError::DatagramTooLarge(src.len()));
        }
        let code = src.get_u8();
        if DISCOVERY_CODE_RANGE.contains(&code) {
            let body = src.split_off(0);
            Ok(Some(DiscoveryDatagram { code, body }))
        } else {
            Err(ParseError::UnknownCode(code))
        }
    }
}

impl Encoder<DiscoveryDatagram> for DiscoveryCodec {
    type Error = ParseError;

    fn encode(&mut self, item: DiscoveryDatagram, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.code);
        dst.extend_from_slice(&item.body);
        if dst.len() > MAX_UDP_DATAGRAM_SIZE {
            return Err(ParseError::DatagramTooLarge(dst.len()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    None = 0,
    Snappy = 1,
}

impl CompressType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressType::None),
            1 => Some(CompressType::Snappy),
            _ => None,
        }
    }
}

/// A single TCP session frame: `version | compress_type | packet_type |
/// packet_id | body_size | packet_size | body`. All multi-byte integers are
/// big-endian.
#[derive(Debug, Clone)]
pub struct SessionFrame {
    pub version: u8,
    pub packet_type: u8,
    pub packet_id: u32,
    pub body: Bytes,
}

const HEADER_LEN: usize = 1 + 1 + 1 + 4 + 4 + 4;

pub struct SessionFrameCodec {
    /// Negotiated protocol version; compression is only attempted when both
    /// sides are at version >= 1 per the handshake result.
    pub remote_version: u8,
}

impl SessionFrameCodec {
    pub fn new(remote_version: u8) -> Self {
        SessionFrameCodec { remote_version }
    }
}

impl Decoder for SessionFrameCodec {
    type Item = SessionFrame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..HEADER_LEN];
        let version = header.get_u8();
        let compress_type =
            CompressType::from_u8(header.get_u8()).ok_or(ParseError::UnknownCode(src[1]))?;
        let packet_type = header.get_u8();
        let packet_id = header.get_u32();
        let body_size = header.get_u32() as usize;
        let packet_size = header.get_u32() as usize;

        if packet_size > MAX_TCP_PACKET_SIZE {
            return Err(ParseError::BigMessage(packet_size));
        }
        if compress_type == CompressType::None && body_size > MAX_TCP_BODY_SIZE_UNCOMPRESSED {
            return Err(ParseError::BodyTooLarge(body_size));
        }

        if src.len() < HEADER_LEN + body_size {
            src.reserve(HEADER_LEN + body_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let raw_body = src.split_to(body_size);

        let body = match compress_type {
            CompressType::None => raw_body.freeze(),
            CompressType::Snappy => {
                if packet_size >= DECOMPRESSION_BOMB_THRESHOLD {
                    return Err(ParseError::DecompressionBomb);
                }
                let mut decoder = snap::raw::Decoder::new();
                let decompressed = decoder
                    .decompress_vec(&raw_body)
                    .map_err(ParseError::Decompress)?;
                Bytes::from(decompressed)
            }
        };

        Ok(Some(SessionFrame {
            version,
            packet_type,
            packet_id,
            body,
        }))
    }
}

impl Encoder<SessionFrame> for SessionFrameCodec {
    type Error = ParseError;

    /// Compresses when the remote has negotiated version >= 1 *and* the
    /// compressed form is strictly shorter, matching §4.A: compression is
    /// never applied if it would not actually shrink the frame.
    fn encode(&mut self, item: SessionFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let uncompressed_len = item.body.len();
        let (compress_type, body_size, packet_size, payload) = if self.remote_version >= 1 {
            let mut encoder = snap::raw::Encoder::new();
            let compressed = encoder
                .compress_vec(&item.body)
                .map_err(ParseError::Decompress)?;
            if compressed.len() < uncompressed_len {
                (
                    CompressType::Snappy,
                    compressed.len(),
                    uncompressed_len,
                    compressed,
                )
            } else {
                (
                    CompressType::None,
                    uncompressed_len,
                    uncompressed_len,
                    item.body.to_vec(),
                )
            }
        } else {
            (
                CompressType::None,
                uncompressed_len,
                uncompressed_len,
                item.body.to_vec(),
            )
        };

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(item.version);
        dst.put_u8(compress_type as u8);
        dst.put_u8(item.packet_type);
        dst.put_u32(item.packet_id);
        dst.put_u32(body_size as u32);
        dst.put_u32(packet_size as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_round_trip() {
        let mut codec = DiscoveryCodec;
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        primitive::put_long(&mut body, 0xdead_beef_u64);
        let datagram = DiscoveryDatagram {
            code: KAD_PING,
            body,
        };
        codec.encode(datagram.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.code, datagram.code);
        assert_eq!(decoded.body, datagram.body);
    }

    #[test]
    fn oversized_datagram_rejected() {
        let mut codec = DiscoveryCodec;
        let mut buf = BytesMut::new();
        buf.resize(MAX_UDP_DATAGRAM_SIZE + 1, 0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::DatagramTooLarge(_))
        ));
    }

    #[test]
    fn one_byte_datagram_rejected() {
        let mut codec = DiscoveryCodec;
        let mut buf = BytesMut::from(&[KAD_PING][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::DatagramTooLarge(_))
        ));
    }

    #[test]
    fn session_frame_round_trip_uncompressed() {
        let mut codec = SessionFrameCodec::new(0);
        let mut buf = BytesMut::new();
        let frame = SessionFrame {
            version: 0,
            packet_type: PING,
            packet_id: 7,
            body: Bytes::from_static(b"hello"),
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.packet_type, frame.packet_type);
        assert_eq!(decoded.body, frame.body);
    }

    #[test]
    fn session_frame_round_trip_compressed() {
        let mut codec = SessionFrameCodec::new(1);
        let mut buf = BytesMut::new();
        let body = vec![0x42u8; 4096];
        let frame = SessionFrame {
            version: 1,
            packet_type: PING,
            packet_id: 1,
            body: Bytes::from(body.clone()),
        };
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.body.as_ref(), body.as_slice());
    }

    #[test]
    fn version_zero_never_compresses() {
        let mut codec = SessionFrameCodec::new(0);
        let mut buf_v0 = BytesMut::new();
        let body = Bytes::from(vec![0x00u8; 2048]);
        codec
            .encode(
                SessionFrame {
                    version: 0,
                    packet_type: PING,
                    packet_id: 1,
                    body: body.clone(),
                },
                &mut buf_v0,
            )
            .unwrap();
        // byte 1 is compress_type; must be 0 (None) at version 0.
        assert_eq!(buf_v0[1], CompressType::None as u8);
    }

    #[test]
    fn oversized_packet_size_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(PING);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32((MAX_TCP_PACKET_SIZE + 1) as u32);
        let mut codec = SessionFrameCodec::new(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::BigMessage(_))
        ));
    }
}
