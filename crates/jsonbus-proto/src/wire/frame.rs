//! ZMTP frame encoding and incremental decoding.
//!
//! ```text
//! short frame: [flags:1][size:1][payload:size]
//! long frame:  [flags:1][size:8 BE][payload:size]
//!
//! flags: bit0 MORE, bit1 LONG, bit2 COMMAND (ZMTP 3.x only)
//! ```
//!
//! Decoding peeks at the header and only consumes bytes once the whole frame
//! is buffered, so partial reads simply return `Ok(None)`.

use crate::error::{ProtoError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FLAG_MORE: u8 = 0x01;
pub const FLAG_LONG: u8 = 0x02;
pub const FLAG_COMMAND: u8 = 0x04;

/// Which frame layout the connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// ZMTP 2.0: no command bit.
    Legacy,
    /// ZMTP 3.x.
    Current,
}

impl Framing {
    fn reserved_mask(&self) -> u8 {
        match self {
            Framing::Legacy => !(FLAG_MORE | FLAG_LONG),
            Framing::Current => !(FLAG_MORE | FLAG_LONG | FLAG_COMMAND),
        }
    }
}

/// One unit of the binary wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub more: bool,
    pub command: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Application data frame.
    pub fn data(payload: impl Into<Bytes>, more: bool) -> Self {
        Self {
            more,
            command: false,
            payload: payload.into(),
        }
    }

    /// Command frame. Commands are always single frames.
    pub fn command(payload: impl Into<Bytes>) -> Self {
        Self {
            more: false,
            command: true,
            payload: payload.into(),
        }
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, framing: Framing, dst: &mut BytesMut) -> Result<()> {
        if self.command && framing == Framing::Legacy {
            return Err(ProtoError::Frame {
                message: "legacy framing has no command frames".to_string(),
            });
        }

        let len = self.payload.len();
        let mut flags = 0u8;
        if self.more {
            flags |= FLAG_MORE;
        }
        if self.command {
            flags |= FLAG_COMMAND;
        }

        if len > u8::MAX as usize {
            dst.reserve(9 + len);
            dst.put_u8(flags | FLAG_LONG);
            dst.put_u64(len as u64);
        } else {
            dst.reserve(2 + len);
            dst.put_u8(flags);
            dst.put_u8(len as u8);
        }
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Try to take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Reserved flag bits and
    /// oversize lengths are protocol violations.
    pub fn decode(src: &mut BytesMut, framing: Framing, max_size: u64) -> Result<Option<Frame>> {
        if src.is_empty() {
            return Ok(None);
        }

        let flags = src[0];
        if flags & framing.reserved_mask() != 0 {
            return Err(ProtoError::Frame {
                message: format!("reserved flag bits set: {:#04x}", flags),
            });
        }

        let command = flags & FLAG_COMMAND != 0;
        let more = flags & FLAG_MORE != 0;
        if command && more {
            return Err(ProtoError::Frame {
                message: "command frame with MORE flag".to_string(),
            });
        }

        let (header_len, size) = if flags & FLAG_LONG != 0 {
            if src.len() < 9 {
                return Ok(None);
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&src[1..9]);
            (9, u64::from_be_bytes(size_bytes))
        } else {
            if src.len() < 2 {
                return Ok(None);
            }
            (2, src[1] as u64)
        };

        if size > max_size {
            return Err(ProtoError::FrameTooLarge {
                size,
                max: max_size,
            });
        }

        let size = size as usize;
        if src.len() < header_len + size {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(size).freeze();

        Ok(Some(Frame {
            more,
            command,
            payload,
        }))
    }
}
