//! ZMTP command bodies.
//!
//! ```text
//! command:  [name-len:1][name][data]
//! property: [name-len:1][name][value-len:4 BE][value]
//! ```

use crate::error::{ProtoError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const READY: &str = "READY";
pub const ERROR: &str = "ERROR";
pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const CANCEL: &str = "CANCEL";
pub const HELLO: &str = "HELLO";
pub const WELCOME: &str = "WELCOME";
pub const INITIATE: &str = "INITIATE";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

pub const PROP_SOCKET_TYPE: &str = "Socket-Type";
pub const PROP_IDENTITY: &str = "Identity";

/// A decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub body: Bytes,
}

impl Command {
    pub fn new(name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    pub fn error(reason: &str) -> Self {
        let reason = &reason.as_bytes()[..reason.len().min(255)];
        let mut body = BytesMut::with_capacity(1 + reason.len());
        body.put_u8(reason.len() as u8);
        body.extend_from_slice(reason);
        Self::new(ERROR, body.freeze())
    }

    pub fn hello(username: &str, password: &str) -> Result<Self> {
        if username.len() > 255 || password.len() > 255 {
            return Err(ProtoError::Handshake {
                message: "PLAIN credentials longer than 255 bytes".to_string(),
            });
        }
        let mut body = BytesMut::with_capacity(2 + username.len() + password.len());
        body.put_u8(username.len() as u8);
        body.extend_from_slice(username.as_bytes());
        body.put_u8(password.len() as u8);
        body.extend_from_slice(password.as_bytes());
        Ok(Self::new(HELLO, body.freeze()))
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err(ProtoError::Frame {
                message: format!("invalid command name length {}", self.name.len()),
            });
        }
        let mut buf = BytesMut::with_capacity(1 + self.name.len() + self.body.len());
        buf.put_u8(self.name.len() as u8);
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self> {
        let name_len = *payload.first().ok_or_else(|| ProtoError::Frame {
            message: "empty command frame".to_string(),
        })? as usize;
        if name_len == 0 || payload.len() < 1 + name_len {
            return Err(ProtoError::Frame {
                message: "truncated command name".to_string(),
            });
        }
        let name = std::str::from_utf8(&payload[1..1 + name_len])
            .map_err(|_| ProtoError::Frame {
                message: "command name is not ASCII".to_string(),
            })?
            .to_string();
        Ok(Self {
            name,
            body: payload.slice(1 + name_len..),
        })
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Reason text of an `ERROR` command.
    pub fn error_reason(&self) -> String {
        match self.body.first() {
            Some(&len) if self.body.len() > len as usize => {
                String::from_utf8_lossy(&self.body[1..1 + len as usize]).into_owned()
            }
            _ => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }

    /// Username and password of a `HELLO` command.
    pub fn hello_credentials(&self) -> Result<(String, String)> {
        let mut body = self.body.clone();
        let username = take_short_string(&mut body)?;
        let password = take_short_string(&mut body)?;
        Ok((username, password))
    }
}

fn take_short_string(buf: &mut Bytes) -> Result<String> {
    if buf.is_empty() {
        return Err(ProtoError::Handshake {
            message: "truncated HELLO".to_string(),
        });
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return Err(ProtoError::Handshake {
            message: "truncated HELLO".to_string(),
        });
    }
    let raw = buf.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Ordered metadata properties of a handshake command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, Bytes)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Property names are case-insensitive.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        for (name, value) in &self.entries {
            if name.is_empty() || name.len() > 255 {
                return Err(ProtoError::Handshake {
                    message: format!("invalid property name {:?}", name),
                });
            }
            dst.put_u8(name.len() as u8);
            dst.extend_from_slice(name.as_bytes());
            dst.put_u32(value.len() as u32);
            dst.extend_from_slice(value);
        }
        Ok(())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let mut props = Properties::new();
        while !body.is_empty() {
            let name_len = body.get_u8() as usize;
            if name_len == 0 || body.len() < name_len + 4 {
                return Err(ProtoError::Handshake {
                    message: "malformed property length".to_string(),
                });
            }
            let name = String::from_utf8_lossy(&body.split_to(name_len)).into_owned();
            let value_len = body.get_u32() as usize;
            if body.len() < value_len {
                return Err(ProtoError::Handshake {
                    message: format!("property {} value truncated", name),
                });
            }
            let value = body.split_to(value_len);
            props.entries.push((name, value));
        }
        Ok(props)
    }
}

/// Metadata command exchanged during the handshake (`READY` or `INITIATE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeCommand {
    pub name: String,
    pub properties: Properties,
}

impl HandshakeCommand {
    pub fn ready(properties: Properties) -> Self {
        Self {
            name: READY.to_string(),
            properties,
        }
    }

    pub fn initiate(properties: Properties) -> Self {
        Self {
            name: INITIATE.to_string(),
            properties,
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        let mut body = BytesMut::new();
        self.properties.encode(&mut body)?;
        Ok(Command::new(self.name.clone(), body.freeze()))
    }

    pub fn from_command(command: &Command) -> Result<Self> {
        Ok(Self {
            name: command.name.clone(),
            properties: Properties::decode(command.body.clone())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_layout() {
        let mut props = Properties::new();
        props.insert(PROP_SOCKET_TYPE, Bytes::from_static(b"REQ"));
        let cmd = HandshakeCommand::ready(props).to_command().unwrap();
        let encoded = cmd.encode().unwrap();

        let mut expected = vec![5u8];
        expected.extend_from_slice(b"READY");
        expected.push(11);
        expected.extend_from_slice(b"Socket-Type");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"REQ");
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_properties_keep_order_and_ignore_case() {
        let mut props = Properties::new();
        props.insert(PROP_SOCKET_TYPE, Bytes::from_static(b"SUB"));
        props.insert(PROP_IDENTITY, Bytes::from_static(b"peer-1"));
        props.insert("socket-type", Bytes::from_static(b"PUB"));

        let names: Vec<&str> = props.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![PROP_SOCKET_TYPE, PROP_IDENTITY]);
        assert_eq!(props.get("SOCKET-TYPE").unwrap(), &Bytes::from_static(b"PUB"));
    }

    #[test]
    fn test_truncated_property_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(4);
        body.extend_from_slice(b"Name");
        body.put_u32(100);
        body.extend_from_slice(b"short");
        assert!(Properties::decode(body.freeze()).is_err());
    }

    #[test]
    fn test_hello_credentials() {
        let cmd = Command::hello("admin", "secret").unwrap();
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert!(decoded.is(HELLO));
        assert_eq!(
            decoded.hello_credentials().unwrap(),
            ("admin".to_string(), "secret".to_string())
        );
    }

    #[test]
    fn test_error_reason() {
        let cmd = Command::error("Invalid socket type");
        assert_eq!(cmd.error_reason(), "Invalid socket type");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(Command::decode(&Bytes::new()).is_err());
        assert!(Command::decode(&Bytes::from_static(b"\x09SHORT")).is_err());
    }
}
