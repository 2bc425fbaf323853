//! Wire codec for `StreamFrame`, the framing used inside a yamux stream
//! between the bridge and the server: `[opcode:u8][streamId:u32-be]
//! [length:u32-be][payload]`.

use core::fmt;

use bytes::{Buf as _, BufMut as _};

#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    PacketOversized {
        packet_size: usize,
        max: usize,
    },
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PacketOversized { packet_size, max } => {
                write!(f, "packet oversized: max is {max}, got {packet_size}")
            }
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::InvalidPacket { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
}

/// Opcode of a [`StreamFrame`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Payload is `"type\0arg1\0arg2..."`, sent once at the start of a
    /// yamux stream.
    StreamOpen = 0x80,
    /// Payload is opaque bytes flowing in either direction.
    StreamData = 0x81,
    /// Either side is done; payload is usually empty.
    StreamClose = 0x82,
    /// Payload is `[cols:u16-be][rows:u16-be]` (PTY streams only).
    StreamResize = 0x83,
    /// Reserved for a future progress-report frame.
    StreamProgress = 0x84,
    /// Reserved for a future terminal-result frame.
    StreamResult = 0x85,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0x80 => Ok(Opcode::StreamOpen),
            0x81 => Ok(Opcode::StreamData),
            0x82 => Ok(Opcode::StreamClose),
            0x83 => Ok(Opcode::StreamResize),
            0x84 => Ok(Opcode::StreamProgress),
            0x85 => Ok(Opcode::StreamResult),
            _ => Err(Error::InvalidPacket {
                name: StreamFrame::NAME,
                field: "opcode",
                reason: "unknown value",
            }),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::StreamOpen => "STREAM_OPEN",
            Opcode::StreamData => "STREAM_DATA",
            Opcode::StreamClose => "STREAM_CLOSE",
            Opcode::StreamResize => "STREAM_RESIZE",
            Opcode::StreamProgress => "STREAM_PROGRESS",
            Opcode::StreamResult => "STREAM_RESULT",
        };
        write!(f, "{name} (0x{:02X})", *self as u8)
    }
}

/// A single framed message inside a yamux stream.
///
/// `stream_id` mirrors the outer WebSocket frame's stream id for symmetry;
/// it carries no multiplexing meaning of its own since yamux already
/// multiplexes the underlying connection.
#[derive(PartialEq, Eq)]
pub struct StreamFrame {
    pub opcode: Opcode,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl fmt::Debug for StreamFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFrame")
            .field("opcode", &self.opcode)
            .field("stream_id", &self.stream_id)
            .field("payload.len()", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl StreamFrame {
    pub const NAME: &'static str = "STREAM_FRAME";
    pub const HEADER_SIZE: usize = 1 /* opcode */ + 4 /* streamId */ + 4 /* length */;
    pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

    pub fn open(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::StreamOpen,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::StreamData,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            opcode: Opcode::StreamClose,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn resize(stream_id: u32, cols: u16, rows: u16) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u16(cols);
        payload.put_u16(rows);
        Self {
            opcode: Opcode::StreamResize,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Splits an `OpStreamOpen` payload (`"type\0arg1\0arg2..."`) into its
    /// stream type and arguments.
    pub fn parse_open_payload(payload: &[u8]) -> Result<(&str, Vec<&str>), Error> {
        let text = std::str::from_utf8(payload).map_err(|_| Error::InvalidPacket {
            name: Self::NAME,
            field: "payload",
            reason: "not valid UTF-8",
        })?;
        let mut parts = text.split('\0');
        let ty = parts.next().filter(|s| !s.is_empty()).ok_or(Error::InvalidPacket {
            name: Self::NAME,
            field: "payload",
            reason: "missing stream type",
        })?;
        Ok((ty, parts.collect()))
    }

    /// Decodes an `OpStreamResize` payload into `(cols, rows)`.
    pub fn parse_resize_payload(payload: &[u8]) -> Result<(u16, u16), Error> {
        if payload.len() < 4 {
            return Err(Error::NotEnoughBytes {
                name: "STREAM_RESIZE",
                received: payload.len(),
                expected: 4,
            });
        }
        let cols = u16::from_be_bytes([payload[0], payload[1]]);
        let rows = u16::from_be_bytes([payload[2], payload[3]]);
        Ok((cols, rows))
    }

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        if self.payload.len() > Self::MAX_PAYLOAD_SIZE {
            return Err(Error::PacketOversized {
                packet_size: self.payload.len(),
                max: Self::MAX_PAYLOAD_SIZE,
            });
        }

        buf.reserve(self.size());
        buf.put_u8(self.opcode as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(u32::try_from(self.payload.len()).expect("checked against MAX_PAYLOAD_SIZE above"));
        buf.put(self.payload.slice(..));

        Ok(())
    }

    /// Decodes a single frame from `buf`, consuming exactly the bytes it
    /// needs. Returns `Ok(None)` when `buf` doesn't yet contain a full
    /// frame (caller should read more and retry).
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, Error> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let opcode = Opcode::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if length > Self::MAX_PAYLOAD_SIZE {
            return Err(Error::PacketOversized {
                packet_size: length,
                max: Self::MAX_PAYLOAD_SIZE,
            });
        }

        if buf.len() < Self::HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            opcode,
            stream_id,
            payload,
        }))
    }

    /// Decodes a single frame from an exact-size buffer (no partial-read
    /// handling); used when a full frame has already been read off the
    /// wire by the caller.
    pub fn decode_exact(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::HEADER_SIZE] for Self::NAME);

        let opcode = Opcode::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        let length = buf.get_u32() as usize;

        ensure_size!(buf[length] for Self::NAME);

        Ok(Self {
            opcode,
            stream_id,
            payload: buf.split_to(length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_stream_open() {
        let frame = StreamFrame::open(1, Bytes::from_static(b"ping\0ok"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        let decoded = StreamFrame::decode(&mut buf).unwrap().expect("full frame");
        assert_eq!(decoded.opcode, Opcode::StreamOpen);
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(&decoded.payload[..], b"ping\0ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_reports_incomplete_frame() {
        let frame = StreamFrame::data(7, Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        assert!(StreamFrame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn parses_open_payload_type_and_args() {
        let (ty, args) = StreamFrame::parse_open_payload(b"terminal\x0080\x0024").unwrap();
        assert_eq!(ty, "terminal");
        assert_eq!(args, vec!["80", "24"]);
    }

    #[test]
    fn resize_payload_round_trips() {
        let frame = StreamFrame::resize(3, 160, 50);
        let (cols, rows) = StreamFrame::parse_resize_payload(&frame.payload).unwrap();
        assert_eq!((cols, rows), (160, 50));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(StreamFrame::decode(&mut buf), Err(Error::InvalidPacket { .. })));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_opcode() -> impl Strategy<Value = Opcode> {
        prop_oneof![
            Just(Opcode::StreamOpen),
            Just(Opcode::StreamData),
            Just(Opcode::StreamClose),
            Just(Opcode::StreamResize),
            Just(Opcode::StreamProgress),
            Just(Opcode::StreamResult),
        ]
    }

    proptest! {
        #[test]
        fn round_trips_any_frame(opcode in arb_opcode(), stream_id in any::<u32>(), payload in prop::collection::vec(any::<u8>(), 0..256)) {
            let frame = StreamFrame {
                opcode,
                stream_id,
                payload: Bytes::from(payload),
            };

            let mut buf = BytesMut::new();
            frame.encode(&mut buf).unwrap();

            let decoded = StreamFrame::decode(&mut buf).unwrap().expect("full frame decodes in one shot");
            prop_assert_eq!(decoded.opcode, frame.opcode);
            prop_assert_eq!(decoded.stream_id, frame.stream_id);
            prop_assert_eq!(&decoded.payload[..], &frame.payload[..]);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = BytesMut::from(&bytes[..]);
            let _ = StreamFrame::decode(&mut buf);
        }
    }
}
