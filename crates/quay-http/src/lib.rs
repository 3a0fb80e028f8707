//! HTTP/1.1 and RFC 6455 wire codecs for the quay server.
//!
//! Three pieces, all synchronous and buffer-driven so the reactor can
//! feed them whatever the socket produced:
//!
//! - [`RequestParser`] — incremental HTTP/1.1 request parsing
//! - [`FrameDecoder`] and the `encode_*` functions — WebSocket framing
//! - [`upgrade_response`] — the 101 Switching Protocols handshake

#![deny(unsafe_code)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod frame;
mod handshake;
mod parser;

pub use frame::{
    DEFAULT_FRAGMENT_THRESHOLD, DEFAULT_MAX_MESSAGE_BYTES, Frame, FrameDecoder, FrameError,
    Opcode, WsEvent, close_code, encode_close, encode_frame, encode_message, encode_pong,
};
pub use handshake::{HandshakeError, accept_key, upgrade_response};
pub use parser::{DEFAULT_MAX_REQUEST_BYTES, ParseError, ParseStatus, RequestParser};
