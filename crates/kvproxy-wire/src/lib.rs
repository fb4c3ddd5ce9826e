// Framing and binary encoding for the call stream protocol.
//
// Every stream starts with one `StreamOpen` frame naming the method, followed by
// any number of `CallRequest` frames from the client. The gateway answers with
// `CallResponse` frames in any order; `id` is the only correlation key.
// Payload bytes are opaque to this crate.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: u32 = 0x4B565031;
pub const VERSION: u16 = 1;
// Flags identify the frame kind.
pub const FLAG_STREAM_OPEN: u16 = 0x0001;
pub const FLAG_CALL_REQUEST: u16 = 0x0002;
pub const FLAG_CALL_RESPONSE: u16 = 0x0004;

/// Response status for a call the gateway completed successfully.
pub const STATUS_OK: u16 = 0;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown frame flags {0:#06x}")]
    UnknownFrame(u16),
    #[error("method name is not valid utf-8")]
    InvalidMethod,
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u16(self.version);
        buf.put_u16(self.flags);
        buf.put_u32(self.length);
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use kvproxy_wire::Frame;
///
/// let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Policy fields inlined into every request.
///
/// `timeout_ms` is the budget left before the caller's deadline at send time;
/// `attrs` is forwarded untouched from the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlinePolicy {
    pub timeout_ms: u32,
    pub attrs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub id: i32,
    pub iteration: i32,
    pub policy: InlinePolicy,
    pub payload: Bytes,
}

impl CallRequest {
    /// Encoded size of everything but the payload.
    pub const FIXED_LEN: usize = 4 + 4 + 4 + 4 + 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub id: i32,
    pub status: u16,
    pub payload: Bytes,
}

impl CallResponse {
    const FIXED_LEN: usize = 4 + 2 + 4;

    pub fn ok(id: i32, payload: Bytes) -> Self {
        Self {
            id,
            status: STATUS_OK,
            payload,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Messages carried on a call stream.
///
/// ```
/// use bytes::Bytes;
/// use kvproxy_wire::{CallRequest, InlinePolicy, Message};
///
/// let message = Message::Request(CallRequest {
///     id: 0,
///     iteration: 1,
///     policy: InlinePolicy::default(),
///     payload: Bytes::from_static(b"key"),
/// });
/// let frame = message.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StreamOpen { method: String },
    Request(CallRequest),
    Response(CallResponse),
}

impl Message {
    fn flags(&self) -> u16 {
        match self {
            Message::StreamOpen { .. } => FLAG_STREAM_OPEN,
            Message::Request(_) => FLAG_CALL_REQUEST,
            Message::Response(_) => FLAG_CALL_RESPONSE,
        }
    }

    /// Length of the frame body, excluding the header.
    pub fn body_len(&self) -> Result<usize> {
        let len = match self {
            Message::StreamOpen { method } => {
                u16::try_from(method.len()).map_err(|_| Error::FrameTooLarge)?;
                2 + method.len()
            }
            Message::Request(request) => CallRequest::FIXED_LEN + request.payload.len(),
            Message::Response(response) => CallResponse::FIXED_LEN + response.payload.len(),
        };
        if len > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(len)
    }

    fn put_body(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Message::StreamOpen { method } => {
                let len = u16::try_from(method.len()).map_err(|_| Error::FrameTooLarge)?;
                buf.put_u16(len);
                buf.extend_from_slice(method.as_bytes());
            }
            Message::Request(request) => {
                let len =
                    u32::try_from(request.payload.len()).map_err(|_| Error::FrameTooLarge)?;
                buf.put_i32(request.id);
                buf.put_i32(request.iteration);
                buf.put_u32(request.policy.timeout_ms);
                buf.put_u32(request.policy.attrs);
                buf.put_u32(len);
                buf.extend_from_slice(&request.payload);
            }
            Message::Response(response) => {
                let len =
                    u32::try_from(response.payload.len()).map_err(|_| Error::FrameTooLarge)?;
                buf.put_i32(response.id);
                buf.put_u16(response.status);
                buf.put_u32(len);
                buf.extend_from_slice(&response.payload);
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::with_capacity(self.body_len()?);
        self.put_body(&mut buf)?;
        Frame::new(self.flags(), buf.freeze())
    }

    /// Encode header and body into one contiguous buffer.
    pub fn encode_bytes(&self) -> Result<Bytes> {
        let body_len = self.body_len()?;
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body_len);
        FrameHeader::new(self.flags(), body_len as u32).encode(&mut buf);
        self.put_body(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let mut buf = frame.payload;
        let message = match frame.header.flags {
            FLAG_STREAM_OPEN => {
                if buf.remaining() < 2 {
                    return Err(Error::Incomplete);
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Err(Error::Incomplete);
                }
                let raw = buf.copy_to_bytes(len);
                let method = String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidMethod)?;
                Message::StreamOpen { method }
            }
            FLAG_CALL_REQUEST => {
                if buf.remaining() < CallRequest::FIXED_LEN {
                    return Err(Error::Incomplete);
                }
                let id = buf.get_i32();
                let iteration = buf.get_i32();
                let timeout_ms = buf.get_u32();
                let attrs = buf.get_u32();
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::Incomplete);
                }
                let payload = buf.split_to(len);
                Message::Request(CallRequest {
                    id,
                    iteration,
                    policy: InlinePolicy { timeout_ms, attrs },
                    payload,
                })
            }
            FLAG_CALL_RESPONSE => {
                if buf.remaining() < CallResponse::FIXED_LEN {
                    return Err(Error::Incomplete);
                }
                let id = buf.get_i32();
                let status = buf.get_u16();
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::Incomplete);
                }
                let payload = buf.split_to(len);
                Message::Response(CallResponse {
                    id,
                    status,
                    payload,
                })
            }
            other => return Err(Error::UnknownFrame(other)),
        };
        if buf.has_remaining() {
            return Err(Error::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}
