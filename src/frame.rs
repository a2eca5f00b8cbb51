//! Frame codec (RFC 6455 §5.2).
//!
//! Stateless encode/decode of a single frame against a byte stream. Client
//! frames are masked by protocol contract; server frames never are.

use crate::error::{WsError, WsResult};
use crate::types::{Frame, OpCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FIN_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const PAYLOAD_LEN_MASK: u8 = 0x7F;
const MASK_KEY_LENGTH: usize = 4;

/// Safety bound against malformed or hostile 64-bit length fields.
pub const MAX_PAYLOAD_LEN: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB

/// Decodes one frame from the stream.
///
/// Returns `Ok(None)` for a frame that must be dropped without closing the
/// connection: a client frame missing the mandatory mask bit, or one
/// carrying a reserved opcode. End-of-stream mid-frame is
/// [`WsError::StreamClosed`]; a 64-bit length over 2 GiB is
/// [`WsError::PayloadTooLarge`] and fatal to the connection.
pub async fn read_frame<R>(stream: &mut R) -> WsResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    read_exact(stream, &mut header).await?;

    let fin = header[0] & FIN_BIT != 0;
    let opcode = OpCode::from_u4(header[0] & OPCODE_MASK);

    // A client frame without the mask bit is a protocol violation; signal
    // the caller to drop it rather than close.
    if header[1] & MASK_BIT == 0 {
        return Ok(None);
    }

    let payload_len = read_payload_len(stream, header[1] & PAYLOAD_LEN_MASK).await?;

    let mut mask_key = [0u8; MASK_KEY_LENGTH];
    read_exact(stream, &mut mask_key).await?;

    let mut payload = vec![0u8; payload_len as usize];
    read_exact(stream, &mut payload).await?;
    apply_mask(&mut payload, mask_key);

    // Reserved opcode: the frame is consumed to keep the stream in sync,
    // then dropped.
    let Some(opcode) = opcode else {
        return Ok(None);
    };

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

async fn read_payload_len<R>(stream: &mut R, indicator: u8) -> WsResult<u64>
where
    R: AsyncRead + Unpin,
{
    match indicator {
        126 => {
            let mut buf = [0u8; 2];
            read_exact(stream, &mut buf).await?;
            Ok(u64::from(u16::from_be_bytes(buf)))
        }
        127 => {
            let mut buf = [0u8; 8];
            read_exact(stream, &mut buf).await?;
            let len = u64::from_be_bytes(buf);
            if len > MAX_PAYLOAD_LEN {
                return Err(WsError::PayloadTooLarge(len));
            }
            Ok(len)
        }
        n => Ok(u64::from(n)),
    }
}

/// Encodes and writes one unmasked server frame in a single operation.
pub async fn write_frame<W>(
    stream: &mut W,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
) -> WsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(opcode, payload, fin);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Assembles the wire bytes of one server-to-client frame. Server frames
/// are never masked, so no mask key is written.
pub fn encode_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 10);

    let first = if fin { FIN_BIT } else { 0 } | opcode.as_u4();
    buf.push(first);

    if payload.len() < 126 {
        buf.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.push(126);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    buf.extend_from_slice(payload);
    buf
}

/// XORs byte `i` with `key[i % 4]`. Involutive: applying twice with the
/// same key restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_LENGTH];
    }
}

/// `read_exact` with end-of-stream mapped to the codec's hard failure.
async fn read_exact<R>(stream: &mut R, buf: &mut [u8]) -> WsResult<()>
where
    R: AsyncRead + Unpin,
{
    stream.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WsError::StreamClosed
        } else {
            WsError::Io(e)
        }
    })?;
    Ok(())
}
