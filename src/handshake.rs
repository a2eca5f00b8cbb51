//! HTTP upgrade handshake (RFC 6455 §4.2).
//!
//! Reads and tokenizes the upgrade request, validates the websocket
//! headers, and writes the `101 Switching Protocols` response. Only the
//! request-line and header tokenizing the handshake needs; this is not a
//! general HTTP parser.

use crate::error::{WsError, WsResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP header block; exceeding it is fatal.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

const MIN_WEBSOCKET_VERSION: u32 = 13;
const KEY_HEADER: &str = "Sec-WebSocket-Key";
const VERSION_HEADER: &str = "Sec-WebSocket-Version";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed upgrade request, built once per connection and immutable after.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    /// Request target up to the first `?`
    pub route: String,
    /// Header map, first occurrence wins, keys case-sensitive as received
    pub headers: HashMap<String, String>,
    /// `&`-separated `key=value` pairs after the first `?`; malformed
    /// pairs are skipped
    pub query_params: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Tokenizes a raw header block. Lines containing the protocol version
    /// token (`HTTP`) are treated as the request/status line, not headers.
    pub fn parse(raw: &str) -> Self {
        let mut request = Self::default();

        for line in raw.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            if line.contains("HTTP") {
                request.parse_request_line(line);
                continue;
            }
            if let Some(idx) = line.find(':') {
                let key = &line[..idx];
                // +2 skips the separator and the space after it
                if idx + 2 <= line.len() {
                    let value = &line[idx + 2..];
                    request
                        .headers
                        .entry(key.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }

        request
    }

    fn parse_request_line(&mut self, line: &str) {
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 {
            return;
        }
        let target = parts[1];

        match target.split_once('?') {
            Some((route, query)) => {
                self.route = route.to_string();
                for pair in query.split('&') {
                    let Some((key, value)) = pair.split_once('=') else {
                        continue;
                    };
                    if key.is_empty() || value.contains('=') {
                        continue;
                    }
                    self.query_params
                        .entry(key.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
            None => self.route = target.to_string(),
        }
    }
}

/// Blocks until a complete header block (terminated by an empty line) is
/// buffered, then parses it. The read is bounded by [`MAX_HEADER_BYTES`].
pub async fn read_request<R>(stream: &mut R) -> WsResult<HandshakeRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(WsError::HeaderTooLarge);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(WsError::StreamClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if contains_terminator(&buf) {
            let raw = String::from_utf8_lossy(&buf);
            return Ok(HandshakeRequest::parse(&raw));
        }
    }
}

fn contains_terminator(buf: &[u8]) -> bool {
    buf.windows(HEADER_TERMINATOR.len())
        .any(|w| w == HEADER_TERMINATOR)
}

/// Validates the upgrade request. Each failure carries a distinct
/// human-readable reason and must abort the handshake without the
/// connection ever transitioning to Open.
pub fn validate(request: &HandshakeRequest) -> WsResult<()> {
    if request.route.is_empty() || request.headers.is_empty() {
        return Err(WsError::Handshake(
            "failed to read request metadata from stream".to_string(),
        ));
    }

    if !request.headers.contains_key(KEY_HEADER) || !request.headers.contains_key(VERSION_HEADER) {
        return Err(WsError::Handshake(
            "missing required websocket upgrade headers".to_string(),
        ));
    }

    let version = request.headers[VERSION_HEADER].trim().parse::<u32>().ok();
    match version {
        Some(v) if v >= MIN_WEBSOCKET_VERSION => Ok(()),
        _ => Err(WsError::Handshake(format!(
            "websocket version {} not supported, must be {} or higher",
            request.headers[VERSION_HEADER], MIN_WEBSOCKET_VERSION
        ))),
    }
}

/// `base64(sha1(key + magic GUID))` per RFC 6455 §4.2.2.
pub fn compute_accept_key(sec_websocket_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_websocket_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Writes the `101 Switching Protocols` response, blank-line terminated.
pub async fn write_accept_response<W>(stream: &mut W, accept_key: &str) -> WsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
