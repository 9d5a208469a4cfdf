//! Versioned byte layout for [`Message`] frames.
//!
//! All integers are big-endian. Every frame starts with the header
//!
//! ```text
//! version:u8 | kind:u8 | status:i32 | sequence:u64 | timestamp:u64 | follower_id:i32
//! ```
//!
//! where a timestamp of 0 and a follower id of -1 mean "absent". The text
//! fields follow, in one of two layouts:
//!
//! - [`WireFormat::Fixed`] (version 1): each field is a `u16` length followed
//!   by a zero-padded slot of its maximum size, so every frame is exactly
//!   [`FIXED_FRAME_LEN`] bytes.
//! - [`WireFormat::LengthPrefixed`] (version 2): the frame starts with a `u32`
//!   byte count for the rest of the frame; the key carries a `u16` length,
//!   value and response a `u32` length, with no padding.
//!
//! Both sides of a connection must use the same layout.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::{Kind, MAX_KEY_LEN, MAX_RESPONSE_LEN, MAX_VALUE_LEN, Message, Status};

pub const FIXED_VERSION: u8 = 1;
pub const LENGTH_PREFIXED_VERSION: u8 = 2;

const HEADER_LEN: usize = 1 + 1 + 4 + 8 + 8 + 4;

/// Size of every frame in the fixed layout.
pub const FIXED_FRAME_LEN: usize =
    HEADER_LEN + (2 + MAX_KEY_LEN) + (2 + MAX_VALUE_LEN) + (2 + MAX_RESPONSE_LEN);

/// Largest body (after the length prefix) the length-prefixed layout accepts.
const MAX_PREFIXED_BODY: usize =
    HEADER_LEN + (2 + MAX_KEY_LEN) + (4 + MAX_VALUE_LEN) + (4 + MAX_RESPONSE_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WireFormat {
    #[default]
    Fixed,
    LengthPrefixed,
}

impl WireFormat {
    pub fn version(self) -> u8 {
        match self {
            WireFormat::Fixed => FIXED_VERSION,
            WireFormat::LengthPrefixed => LENGTH_PREFIXED_VERSION,
        }
    }

    /// Encodes a complete frame, including the length prefix where used.
    pub fn encode(self, message: &Message) -> Result<Bytes, ProtocolError> {
        check_len("key", &message.key, MAX_KEY_LEN)?;
        check_len("value", &message.value, MAX_VALUE_LEN)?;
        check_len("response", &message.response, MAX_RESPONSE_LEN)?;

        match self {
            WireFormat::Fixed => {
                let mut buf = BytesMut::with_capacity(FIXED_FRAME_LEN);
                put_header(&mut buf, self.version(), message)?;
                put_padded(&mut buf, &message.key, MAX_KEY_LEN);
                put_padded(&mut buf, &message.value, MAX_VALUE_LEN);
                put_padded(&mut buf, &message.response, MAX_RESPONSE_LEN);
                Ok(buf.freeze())
            }
            WireFormat::LengthPrefixed => {
                let body_len = HEADER_LEN
                    + (2 + message.key.len())
                    + (4 + message.value.len())
                    + (4 + message.response.len());
                let mut buf = BytesMut::with_capacity(4 + body_len);
                buf.put_u32(body_len as u32);
                put_header(&mut buf, self.version(), message)?;
                buf.put_u16(message.key.len() as u16);
                buf.put_slice(message.key.as_bytes());
                buf.put_u32(message.value.len() as u32);
                buf.put_slice(message.value.as_bytes());
                buf.put_u32(message.response.len() as u32);
                buf.put_slice(message.response.as_bytes());
                Ok(buf.freeze())
            }
        }
    }

    /// Decodes a complete frame as produced by [`WireFormat::encode`].
    pub fn decode(self, frame: &[u8]) -> Result<Message, ProtocolError> {
        match self {
            WireFormat::Fixed => decode_fixed(frame),
            WireFormat::LengthPrefixed => {
                let mut buf = frame;
                need(buf.remaining(), 4)?;
                let declared = buf.get_u32() as usize;
                if declared != buf.remaining() {
                    return Err(ProtocolError::LengthMismatch {
                        declared,
                        actual: buf.remaining(),
                    });
                }
                decode_prefixed_body(buf)
            }
        }
    }
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_message<R>(reader: &mut R, format: WireFormat) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match format {
        WireFormat::Fixed => {
            let mut frame = BytesMut::zeroed(FIXED_FRAME_LEN);
            if !fill_or_eof(reader, &mut frame[..]).await? {
                return Ok(None);
            }
            decode_fixed(&frame).map(Some)
        }
        WireFormat::LengthPrefixed => {
            let mut prefix = [0u8; 4];
            if !fill_or_eof(reader, &mut prefix).await? {
                return Ok(None);
            }
            let len = (&prefix[..]).get_u32() as usize;
            if len > MAX_PREFIXED_BODY {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            let mut body = BytesMut::zeroed(len);
            reader.read_exact(&mut body[..]).await?;
            decode_prefixed_body(&body).map(Some)
        }
    }
}

/// Encodes and writes one frame, flushing so the peer sees it promptly.
pub async fn write_message<W>(writer: &mut W, format: WireFormat, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = format.encode(message)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Fills `buf` completely. `Ok(false)` means EOF before the first byte.
async fn fill_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        filled += n;
    }
    Ok(true)
}

fn check_len(field: &'static str, text: &str, max: usize) -> Result<(), ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: text.len(),
            max,
        });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, version: u8, message: &Message) -> Result<(), ProtocolError> {
    let follower_id = match message.follower_id {
        Some(id) => i32::try_from(id).map_err(|_| ProtocolError::OutOfRange("follower id"))?,
        None => -1,
    };
    buf.put_u8(version);
    buf.put_u8(message.kind as u8);
    buf.put_i32(message.status.code());
    buf.put_u64(message.sequence);
    buf.put_u64(message.timestamp.unwrap_or(0));
    buf.put_i32(follower_id);
    Ok(())
}

fn put_padded(buf: &mut BytesMut, text: &str, slot: usize) {
    buf.put_u16(text.len() as u16);
    buf.put_slice(text.as_bytes());
    buf.put_bytes(0, slot - text.len());
}

fn decode_fixed(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() != FIXED_FRAME_LEN {
        return Err(ProtocolError::LengthMismatch {
            declared: FIXED_FRAME_LEN,
            actual: frame.len(),
        });
    }
    let mut buf = frame;
    let mut message = get_header(&mut buf, FIXED_VERSION)?;
    message.key = get_padded(&mut buf, "key", MAX_KEY_LEN)?;
    message.value = get_padded(&mut buf, "value", MAX_VALUE_LEN)?;
    message.response = get_padded(&mut buf, "response", MAX_RESPONSE_LEN)?;
    Ok(message)
}

fn decode_prefixed_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut buf = body;
    let mut message = get_header(&mut buf, LENGTH_PREFIXED_VERSION)?;
    need(buf.remaining(), 2)?;
    let key_len = buf.get_u16() as usize;
    message.key = get_text(&mut buf, "key", key_len, MAX_KEY_LEN)?;
    need(buf.remaining(), 4)?;
    let value_len = buf.get_u32() as usize;
    message.value = get_text(&mut buf, "value", value_len, MAX_VALUE_LEN)?;
    need(buf.remaining(), 4)?;
    let response_len = buf.get_u32() as usize;
    message.response = get_text(&mut buf, "response", response_len, MAX_RESPONSE_LEN)?;
    if buf.has_remaining() {
        return Err(ProtocolError::LengthMismatch {
            declared: body.len() - buf.remaining(),
            actual: body.len(),
        });
    }
    Ok(message)
}

/// Fails unless `remaining` bytes cover the `needed` ones about to be read.
fn need(remaining: usize, needed: usize) -> Result<(), ProtocolError> {
    if remaining < needed {
        return Err(ProtocolError::LengthMismatch {
            declared: needed,
            actual: remaining,
        });
    }
    Ok(())
}

fn get_header(buf: &mut &[u8], expected: u8) -> Result<Message, ProtocolError> {
    need(buf.remaining(), HEADER_LEN)?;
    let version = buf.get_u8();
    if version != expected {
        return Err(ProtocolError::UnsupportedVersion {
            found: version,
            expected,
        });
    }
    let kind = Kind::try_from(buf.get_u8())?;
    let status = Status::try_from(buf.get_i32())?;
    let sequence = buf.get_u64();
    let timestamp = buf.get_u64();
    let follower_id = match buf.get_i32() {
        -1 => None,
        id => Some(u32::try_from(id).map_err(|_| ProtocolError::OutOfRange("follower id"))?),
    };

    let mut message = Message::new(kind);
    message.status = status;
    message.sequence = sequence;
    message.timestamp = (timestamp != 0).then_some(timestamp);
    message.follower_id = follower_id;
    Ok(message)
}

fn get_text(buf: &mut &[u8], field: &'static str, len: usize, max: usize) -> Result<String, ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    need(buf.remaining(), len)?;
    let text = utf8(field, &buf[..len])?;
    buf.advance(len);
    Ok(text)
}

/// Reads a `u16` length and its zero-padded slot; the padding is skipped.
fn get_padded(buf: &mut &[u8], field: &'static str, slot: usize) -> Result<String, ProtocolError> {
    need(buf.remaining(), 2 + slot)?;
    let len = buf.get_u16() as usize;
    if len > slot {
        return Err(ProtocolError::FieldTooLong { field, len, max: slot });
    }
    let text = utf8(field, &buf[..len])?;
    buf.advance(slot);
    Ok(text)
}

fn utf8(field: &'static str, bytes: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}
