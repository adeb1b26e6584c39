//! Binary frame format for data channel traffic.
//!
//! # Frame format
//!
//! ```text
//! CONTROL: [0x00][JSON envelope bytes]
//!
//! CHUNK:   [0x01]
//!          [2 bytes BE: path_len]
//!          [path_len bytes: relative path UTF-8]
//!          [8 bytes BE: byte offset within the file]
//!          [1 byte: flags (bit 0 = last chunk of file)]
//!          [remaining bytes: chunk payload]
//! ```
//!
//! Each frame is one transport message; the transport preserves message
//! boundaries and in-order delivery per channel.

use crate::ProtocolError;
use crate::envelope::Envelope;

/// Frame kind byte: JSON control envelope.
pub const FRAME_CONTROL: u8 = 0x00;

/// Frame kind byte: binary file chunk.
pub const FRAME_CHUNK: u8 = 0x01;

/// Chunk flag: this is the final chunk of its file.
pub const FLAG_LAST_CHUNK: u8 = 0b0000_0001;

/// A slice of file payload travelling on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// Relative file path (manifest key).
    pub path: String,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
    /// Whether this is the last chunk of the file.
    pub last: bool,
    /// Raw chunk data.
    pub payload: Vec<u8>,
}

/// A decoded transport message.
#[derive(Debug, Clone)]
pub enum Frame {
    Control(Envelope),
    Chunk(ChunkFrame),
}

/// Encodes a control envelope into a transport frame.
pub fn encode_control(message: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(message)?;
    let mut buf = Vec::with_capacity(1 + json.len());
    buf.push(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Encodes a chunk into a transport frame.
pub fn encode_chunk(chunk: &ChunkFrame) -> Result<Vec<u8>, ProtocolError> {
    let path_bytes = chunk.path.as_bytes();
    if path_bytes.len() > u16::MAX as usize {
        return Err(ProtocolError::PathTooLong(path_bytes.len()));
    }

    let mut buf = Vec::with_capacity(1 + 2 + path_bytes.len() + 8 + 1 + chunk.payload.len());
    buf.push(FRAME_CHUNK);
    buf.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(path_bytes);
    buf.extend_from_slice(&chunk.offset.to_be_bytes());
    buf.push(if chunk.last { FLAG_LAST_CHUNK } else { 0 });
    buf.extend_from_slice(&chunk.payload);
    Ok(buf)
}

/// Decodes a transport frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let (&kind, rest) = bytes
        .split_first()
        .ok_or_else(|| ProtocolError::MalformedFrame("empty frame".into()))?;

    match kind {
        FRAME_CONTROL => {
            let message: Envelope = serde_json::from_slice(rest)?;
            Ok(Frame::Control(message))
        }
        FRAME_CHUNK => decode_chunk(rest).map(Frame::Chunk),
        other => Err(ProtocolError::MalformedFrame(format!(
            "unknown frame kind: 0x{other:02x}"
        ))),
    }
}

fn decode_chunk(rest: &[u8]) -> Result<ChunkFrame, ProtocolError> {
    if rest.len() < 2 {
        return Err(ProtocolError::MalformedFrame(
            "chunk frame truncated before path length".into(),
        ));
    }
    let path_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];

    if rest.len() < path_len + 8 + 1 {
        return Err(ProtocolError::MalformedFrame(format!(
            "chunk frame truncated: need {} header bytes, have {}",
            path_len + 9,
            rest.len()
        )));
    }

    let path = std::str::from_utf8(&rest[..path_len])
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid UTF-8 path: {e}")))?
        .to_string();
    let rest = &rest[path_len..];

    let mut offset_bytes = [0u8; 8];
    offset_bytes.copy_from_slice(&rest[..8]);
    let offset = u64::from_be_bytes(offset_bytes);

    let flags = rest[8];
    let payload = rest[9..].to_vec();

    Ok(ChunkFrame {
        path,
        offset,
        last: flags & FLAG_LAST_CHUNK != 0,
        payload,
    })
}
