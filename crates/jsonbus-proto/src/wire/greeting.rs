//! ZMTP greeting.
//!
//! ```text
//! signature  [0xFF][padding:8][0x7F]          10 bytes, sent first
//! major      [version:1]                       decides the rest
//! ZMTP 3.x   [minor:1][mechanism:20][as-server:1][filler:31]
//! ZMTP 2.0   [socket-type:1][identity frame]
//! ```
//!
//! The padding is written as a big-endian `1` so a ZMTP 1.0 reader sees a
//! zero-length identity; its low bit tells newer peers we are not 1.0.

use crate::error::{ProtoError, Result};
use bytes::{BufMut, BytesMut};

pub const SIGNATURE_LEN: usize = 10;
/// Signature plus the major version byte.
pub const PREAMBLE_LEN: usize = SIGNATURE_LEN + 1;
/// Bytes after the major version in a ZMTP 3.x greeting.
pub const TAIL_LEN: usize = 53;
pub const GREETING_LEN: usize = PREAMBLE_LEN + TAIL_LEN;

pub const MAJOR_VERSION: u8 = 3;
pub const MINOR_VERSION: u8 = 1;
/// Revision byte of legacy ZMTP 2.0 peers.
pub const LEGACY_REVISION: u8 = 1;

const MECHANISM_LEN: usize = 20;
const FILLER_LEN: usize = 31;

/// Security mechanism announced in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Null,
    Plain,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Null => "NULL",
            Mechanism::Plain => "PLAIN",
        }
    }

    fn from_field(field: &[u8]) -> Result<Self> {
        let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        match &field[..end] {
            b"NULL" => Ok(Mechanism::Null),
            b"PLAIN" => Ok(Mechanism::Plain),
            other => Err(ProtoError::Greeting {
                message: format!(
                    "unsupported mechanism {:?}",
                    String::from_utf8_lossy(other)
                ),
            }),
        }
    }
}

/// Peer version family, decided from the major byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerGeneration {
    /// ZMTP 2.0, no handshake commands.
    Legacy,
    /// ZMTP 3.x, READY handshake.
    Current,
}

/// Write our signature and major version.
pub fn write_preamble(dst: &mut BytesMut) {
    dst.put_u8(0xFF);
    dst.put_u64(1);
    dst.put_u8(0x7F);
    dst.put_u8(MAJOR_VERSION);
}

/// Write the ZMTP 3.x remainder of the greeting.
pub fn write_tail(dst: &mut BytesMut, mechanism: Mechanism, as_server: bool) {
    dst.put_u8(MINOR_VERSION);
    let name = mechanism.as_str().as_bytes();
    dst.extend_from_slice(name);
    dst.put_bytes(0, MECHANISM_LEN - name.len());
    dst.put_u8(as_server as u8);
    dst.put_bytes(0, FILLER_LEN);
}

/// Validate the first bytes a peer sent.
///
/// Fails fast on the first byte so a ZMTP 1.0 peer is reset without waiting
/// for bytes it will never send. Returns `Ok(None)` while incomplete.
pub fn check_preamble(buf: &[u8]) -> Result<Option<PeerGeneration>> {
    if let Some(&first) = buf.first() {
        if first != 0xFF {
            return Err(ProtoError::Greeting {
                message: format!("bad signature byte {:#04x} (pre-2.0 peer?)", first),
            });
        }
    }
    if buf.len() >= SIGNATURE_LEN && buf[SIGNATURE_LEN - 1] & 0x01 == 0 {
        return Err(ProtoError::Greeting {
            message: "signature does not announce ZMTP 2.0 or newer".to_string(),
        });
    }
    if buf.len() < PREAMBLE_LEN {
        return Ok(None);
    }
    match buf[SIGNATURE_LEN] {
        0 => Err(ProtoError::Greeting {
            message: "peer speaks ZMTP 1.0".to_string(),
        }),
        1 | 2 => Ok(Some(PeerGeneration::Legacy)),
        _ => Ok(Some(PeerGeneration::Current)),
    }
}

/// Parsed ZMTP 3.x greeting tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreetingTail {
    pub minor: u8,
    pub mechanism: Mechanism,
    pub as_server: bool,
}

impl GreetingTail {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TAIL_LEN {
            return Err(ProtoError::Greeting {
                message: "greeting truncated".to_string(),
            });
        }
        let mechanism = Mechanism::from_field(&buf[1..1 + MECHANISM_LEN])?;
        let as_server = match buf[1 + MECHANISM_LEN] {
            0 => false,
            1 => true,
            other => {
                return Err(ProtoError::Greeting {
                    message: format!("invalid as-server byte {}", other),
                })
            }
        };
        Ok(Self {
            minor: buf[0],
            mechanism,
            as_server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_greeting_is_64_bytes() {
        let mut buf = BytesMut::new();
        write_preamble(&mut buf);
        write_tail(&mut buf, Mechanism::Null, false);
        assert_eq!(buf.len(), GREETING_LEN);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(buf[9], 0x7F);
        assert_eq!(buf[10], MAJOR_VERSION);
        assert_eq!(&buf[12..16], b"NULL");
    }

    #[test]
    fn test_check_preamble() {
        let mut buf = BytesMut::new();
        write_preamble(&mut buf);
        assert_eq!(
            check_preamble(&buf).unwrap(),
            Some(PeerGeneration::Current)
        );
        assert_eq!(check_preamble(&buf[..5]).unwrap(), None);

        let mut legacy = buf.clone();
        legacy[10] = LEGACY_REVISION;
        assert_eq!(
            check_preamble(&legacy).unwrap(),
            Some(PeerGeneration::Legacy)
        );
    }

    #[test]
    fn test_bad_signature_fails_fast() {
        assert!(check_preamble(&[0x01]).is_err());
        let mut sig = [0u8; 11];
        sig[0] = 0xFF;
        sig[9] = 0x7E;
        assert!(check_preamble(&sig).is_err());
    }

    #[test]
    fn test_tail_roundtrip() {
        let mut buf = BytesMut::new();
        write_tail(&mut buf, Mechanism::Plain, true);
        let tail = GreetingTail::decode(&buf).unwrap();
        assert_eq!(tail.minor, MINOR_VERSION);
        assert_eq!(tail.mechanism, Mechanism::Plain);
        assert!(tail.as_server);
    }

    #[test]
    fn test_unknown_mechanism() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.extend_from_slice(b"CURVE");
        buf.put_bytes(0, 15 + 1 + 31);
        assert!(GreetingTail::decode(&buf).is_err());
    }
}
