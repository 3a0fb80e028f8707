//! WebSocket frame codec (RFC 6455 §5).
//!
//! Decoding is incremental: [`FrameDecoder::feed`] appends raw bytes and
//! [`FrameDecoder::next_event`] yields at most one protocol event per
//! call, so a frame header arriving one byte at a time costs nothing but
//! repeated `Ok(None)`. Fragmented data frames are coalesced; the handler
//! only ever sees whole messages.
//!
//! Encoding is the server side of the protocol: frames are never masked,
//! and messages above a fragmentation threshold are split into a
//! first-frame-plus-continuations sequence.

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation frame (0x0).
    Continuation,
    /// Text frame (0x1).
    Text,
    /// Binary frame (0x2).
    Binary,
    /// Connection close (0x8).
    Close,
    /// Ping (0x9).
    Ping,
    /// Pong (0xA).
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Close status codes the server emits (RFC 6455 §7.4.1).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Message too big.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal server error.
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether a received code may legally be echoed in a close reply.
    #[must_use]
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Decoded frame, before message assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

/// Frame-layer protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Protocol violation; close with 1002.
    Protocol(&'static str),
    /// Message exceeds the configured cap; close with 1009.
    MessageTooLarge {
        /// Declared or accumulated size.
        size: u64,
        /// Configured limit.
        limit: usize,
    },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "websocket protocol error: {msg}"),
            Self::MessageTooLarge { size, limit } => {
                write!(f, "websocket message too large: {size} bytes (limit {limit})")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// The close code this error maps onto.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => close_code::PROTOCOL_ERROR,
            Self::MessageTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
        }
    }
}

/// A protocol event assembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete data message.
    Message {
        /// Concatenated fragment payloads.
        payload: Vec<u8>,
        /// True for binary, false for text.
        binary: bool,
    },
    /// Ping; the payload must be echoed in a pong.
    Ping(Vec<u8>),
    /// Pong (unsolicited or answering one of ours).
    Pong(Vec<u8>),
    /// Close handshake initiated by the peer.
    Close {
        /// Received close code, if the payload carried one.
        code: Option<u16>,
    },
}

/// Default maximum size of an assembled message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Default encode-side fragmentation threshold (64 KiB).
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 64 * 1024;

/// Incremental frame decoder with message assembly.
pub struct FrameDecoder {
    max_message_bytes: usize,
    buffer: Vec<u8>,
    fragment_opcode: Option<Opcode>,
    fragments: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with the default message cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// Create a decoder with an explicit message cap.
    #[must_use]
    pub fn with_max_message_bytes(limit: usize) -> Self {
        Self {
            max_message_bytes: limit,
            buffer: Vec::new(),
            fragment_opcode: None,
            fragments: Vec::new(),
        }
    }

    /// Append raw bytes from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next protocol event, if a whole frame is buffered.
    ///
    /// Call in a loop until it returns `Ok(None)`. Errors are
    /// unrecoverable for the connection; the caller answers with
    /// [`FrameError::close_code`] and drains.
    pub fn next_event(&mut self) -> Result<Option<WsEvent>, FrameError> {
        loop {
            let Some(frame) = self.try_decode_frame()? else {
                return Ok(None);
            };

            if frame.opcode.is_control() {
                if !frame.fin {
                    return Err(FrameError::Protocol("fragmented control frame"));
                }
                match frame.opcode {
                    Opcode::Close => {
                        let code = if frame.payload.len() >= 2 {
                            Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                        } else {
                            None
                        };
                        return Ok(Some(WsEvent::Close { code }));
                    }
                    Opcode::Ping => return Ok(Some(WsEvent::Ping(frame.payload))),
                    Opcode::Pong => return Ok(Some(WsEvent::Pong(frame.payload))),
                    _ => unreachable!(),
                }
            }

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if self.fragment_opcode.is_some() {
                        return Err(FrameError::Protocol(
                            "data frame while a fragmented message is in progress",
                        ));
                    }
                    if frame.fin {
                        return Ok(Some(WsEvent::Message {
                            binary: frame.opcode == Opcode::Binary,
                            payload: frame.payload,
                        }));
                    }
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragments = frame.payload;
                }
                Opcode::Continuation => {
                    let Some(opcode) = self.fragment_opcode else {
                        return Err(FrameError::Protocol(
                            "continuation frame without an initial frame",
                        ));
                    };
                    self.fragments.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.fragment_opcode = None;
                        return Ok(Some(WsEvent::Message {
                            binary: opcode == Opcode::Binary,
                            payload: std::mem::take(&mut self.fragments),
                        }));
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    /// Decode one frame from the front of the buffer.
    ///
    /// Size and masking violations are detected from the header alone, so
    /// an oversize frame is rejected before its payload ever arrives.
    fn try_decode_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let buf = &self.buffer;
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(FrameError::Protocol("reserved bits set"));
        }
        let opcode = Opcode::from_u8(buf[0]).ok_or(FrameError::Protocol("unknown opcode"))?;

        let masked = buf[1] & 0x80 != 0;
        let len7 = buf[1] & 0x7F;
        let (declared_len, len_bytes): (u64, usize) = match len7 {
            0..=125 => (u64::from(len7), 0),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 2)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(bytes), 8)
            }
        };

        if !masked {
            return Err(FrameError::Protocol("client frame not masked"));
        }
        if opcode.is_control() && declared_len > 125 {
            return Err(FrameError::Protocol("control frame payload over 125 bytes"));
        }
        if !opcode.is_control() {
            let assembled = declared_len.saturating_add(self.fragments.len() as u64);
            if assembled > self.max_message_bytes as u64 {
                return Err(FrameError::MessageTooLarge {
                    size: assembled,
                    limit: self.max_message_bytes,
                });
            }
        }

        let payload_len = declared_len as usize;
        let header_len = 2 + len_bytes + 4;
        let frame_len = header_len + payload_len;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut mask = [0u8; 4];
        mask.copy_from_slice(&buf[2 + len_bytes..header_len]);
        let mut payload = buf[header_len..frame_len].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }
        self.buffer.drain(..frame_len);

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one unmasked server-to-client frame.
#[must_use]
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.push(if fin { 0x80 } else { 0x00 } | opcode.to_u8());
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Encode a data message, fragmenting above `fragment_threshold`.
#[must_use]
pub fn encode_message(payload: &[u8], binary: bool, fragment_threshold: usize) -> Vec<u8> {
    let opcode = if binary { Opcode::Binary } else { Opcode::Text };
    if payload.len() <= fragment_threshold || fragment_threshold == 0 {
        return encode_frame(true, opcode, payload);
    }
    let mut out = Vec::with_capacity(payload.len() + 16);
    let mut chunks = payload.chunks(fragment_threshold).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let fin = chunks.peek().is_none();
        let op = if first { opcode } else { Opcode::Continuation };
        out.extend_from_slice(&encode_frame(fin, op, chunk));
        first = false;
    }
    out
}

/// Encode a close frame. Invalid codes fall back to an empty payload.
#[must_use]
pub fn encode_close(code: u16) -> Vec<u8> {
    if close_code::is_valid(code) {
        encode_frame(true, Opcode::Close, &code.to_be_bytes())
    } else {
        encode_frame(true, Opcode::Close, &[])
    }
}

/// Encode a pong echoing a ping payload.
#[must_use]
pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(true, Opcode::Pong, payload)
}
