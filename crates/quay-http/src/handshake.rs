//! WebSocket upgrade handshake (RFC 6455 §4.2).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quay_core::Request;

/// The GUID appended to the client key before hashing (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Handshake rejection. Every variant answers 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No (or empty) `Sec-WebSocket-Key`.
    MissingKey,
    /// `Sec-WebSocket-Version` absent or not 13.
    UnsupportedVersion,
    /// Cross-origin request to an endpoint that does not allow it.
    OriginDenied,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKey => write!(f, "missing Sec-WebSocket-Key"),
            Self::UnsupportedVersion => write!(f, "unsupported Sec-WebSocket-Version"),
            Self::OriginDenied => write!(f, "origin not allowed for this endpoint"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Compute `Sec-WebSocket-Accept` for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut input = Vec::with_capacity(client_key.len() + WS_GUID.len());
    input.extend_from_slice(client_key.trim().as_bytes());
    input.extend_from_slice(WS_GUID.as_bytes());
    BASE64.encode(sha1(&input))
}

/// Validate an upgrade request and build the 101 response bytes.
///
/// The caller has already established that the request carries
/// `Upgrade: websocket` and that the endpoint is registered;
/// `allow_cross_origin` is the endpoint's CORS flag. When CORS is
/// enabled the request's `Origin` is echoed back; when it is disabled a
/// cross-origin request is refused.
pub fn upgrade_response(
    request: &Request,
    allow_cross_origin: bool,
) -> Result<Vec<u8>, HandshakeError> {
    let key = request
        .headers()
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    match request.headers().get("sec-websocket-version") {
        Some(version) if version.trim() == "13" => {}
        _ => return Err(HandshakeError::UnsupportedVersion),
    }

    let origin = request.headers().get("origin");
    if let Some(origin) = origin {
        if !allow_cross_origin && !same_origin(origin, request.headers().get("host")) {
            return Err(HandshakeError::OriginDenied);
        }
    }

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        accept_key(key)
    );
    if allow_cross_origin {
        if let Some(origin) = origin {
            response.push_str(&format!("Access-Control-Allow-Origin: {origin}\r\n"));
        }
    }
    response.push_str("\r\n");
    Ok(response.into_bytes())
}

/// Whether `origin` names the same authority as the `Host` header.
fn same_origin(origin: &str, host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .trim_end_matches('/');
    authority.eq_ignore_ascii_case(host.trim())
}

/// SHA-1 (RFC 3174). Used only for the handshake accept key.
fn sha1(data: &[u8]) -> [u8; 20] {
    let mut state: [u32; 5] = [
        0x6745_2301,
        0xEFCD_AB89,
        0x98BA_DCFE,
        0x1032_5476,
        0xC3D2_E1F0,
    ];

    let mut message = data.to_vec();
    let bit_len = (data.len() as u64) * 8;
    message.push(0x80);
    while message.len() % 64 != 56 {
        message.push(0);
    }
    message.extend_from_slice(&bit_len.to_be_bytes());

    for block in message.chunks_exact(64) {
        let mut schedule = [0u32; 80];
        for (i, word) in schedule.iter_mut().take(16).enumerate() {
            *word = u32::from_be_bytes([
                block[i * 4],
                block[i * 4 + 1],
                block[i * 4 + 2],
                block[i * 4 + 3],
            ]);
        }
        for i in 16..80 {
            schedule[i] =
                (schedule[i - 3] ^ schedule[i - 8] ^ schedule[i - 14] ^ schedule[i - 16])
                    .rotate_left(1);
        }

        let [mut a, mut b, mut c, mut d, mut e] = state;
        for (i, &word) in schedule.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | (!b & d), 0x5A82_7999),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
                _ => (b ^ c ^ d, 0xCA62_C1D6),
            };
            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }

        state[0] = state[0].wrapping_add(a);
        state[1] = state[1].wrapping_add(b);
        state[2] = state[2].wrapping_add(c);
        state[3] = state[3].wrapping_add(d);
        state[4] = state[4].wrapping_add(e);
    }

    let mut digest = [0u8; 20];
    for (i, word) in state.iter().enumerate() {
        digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    digest
}
