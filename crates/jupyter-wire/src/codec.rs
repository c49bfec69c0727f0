//! Websocket frame codec.
//!
//! Messages without buffers travel as a text frame holding the JSON
//! envelope. Messages with buffers use the Jupyter server binary framing:
//!
//! ```text
//! [n: u32 BE] [offset_0 .. offset_{n-1}: u32 BE] [json] [buffer_1] .. [buffer_{n-1}]
//! ```
//!
//! where `n` counts the JSON part plus each buffer and every offset is an
//! absolute byte position into the frame. Each part ends where the next one
//! starts; the last part runs to the end of the frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{Message, RawMessage};

/// Largest part count accepted from a binary frame header.
const MAX_PARTS: usize = 1024;

/// One websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("truncated frame: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    #[error("bad part count: {0}")]
    BadPartCount(u32),

    #[error("bad offsets in binary frame: {0:?}")]
    BadOffsets(Vec<u32>),

    #[error("invalid content for {msg_type}: {source}")]
    Content {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a message as a websocket frame.
pub fn encode(message: &Message) -> Result<Frame, CodecError> {
    if message.buffers.is_empty() {
        return Ok(Frame::Text(serde_json::to_string(message)?));
    }

    let json = serde_json::to_vec(message)?;
    let parts = 1 + message.buffers.len();
    let header_len = 4 * (parts + 1);
    let body_len = json.len() + message.buffers.iter().map(Bytes::len).sum::<usize>();

    let mut frame = BytesMut::with_capacity(header_len + body_len);
    frame.put_u32(parts as u32);

    let mut offset = header_len;
    frame.put_u32(offset as u32);
    offset += json.len();
    for buffer in &message.buffers {
        frame.put_u32(offset as u32);
        offset += buffer.len();
    }

    frame.put_slice(&json);
    for buffer in &message.buffers {
        frame.put_slice(buffer);
    }
    Ok(Frame::Binary(frame.freeze()))
}

/// Decode a websocket frame into a message.
pub fn decode(frame: &Frame) -> Result<Message, CodecError> {
    match frame {
        Frame::Text(text) => {
            let raw: RawMessage = serde_json::from_str(text)?;
            Message::try_from(raw)
        }
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, CodecError> {
    let end = at + 4;
    let slice = bytes.get(at..end).ok_or(CodecError::Truncated {
        needed: end,
        len: bytes.len(),
    })?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn decode_binary(bytes: &Bytes) -> Result<Message, CodecError> {
    let parts = read_u32(bytes, 0)?;
    if parts == 0 || parts as usize > MAX_PARTS {
        return Err(CodecError::BadPartCount(parts));
    }
    let parts = parts as usize;

    let header_len = 4 * (parts + 1);
    if bytes.len() < header_len {
        return Err(CodecError::Truncated {
            needed: header_len,
            len: bytes.len(),
        });
    }

    let offsets = (0..parts)
        .map(|i| read_u32(bytes, 4 * (i + 1)))
        .collect::<Result<Vec<_>, _>>()?;

    let in_order = offsets.windows(2).all(|w| w[0] <= w[1]);
    let starts_after_header = offsets[0] as usize >= header_len;
    if !in_order || !starts_after_header {
        return Err(CodecError::BadOffsets(offsets));
    }
    if let Some(&last) = offsets.last() {
        if last as usize > bytes.len() {
            return Err(CodecError::Truncated {
                needed: last as usize,
                len: bytes.len(),
            });
        }
    }

    let mut slices = Vec::with_capacity(parts);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets
            .get(i + 1)
            .map(|&next| next as usize)
            .unwrap_or(bytes.len());
        slices.push(bytes.slice(start as usize..end));
    }

    let mut slices = slices.into_iter();
    let json = slices.next().unwrap_or_default();
    let raw: RawMessage = serde_json::from_slice(&json)?;
    let mut message = Message::try_from(raw)?;
    message.buffers = slices.collect();
    Ok(message)
}
