//! ZMTP socket types and the pairing rules between them.

use std::fmt;

/// Socket type announced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Pair,
    Pub,
    Sub,
    Req,
    Rep,
    Dealer,
    Router,
    Pull,
    Push,
    XPub,
    XSub,
}

impl SocketType {
    /// Name carried in the `Socket-Type` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Pair => "PAIR",
            SocketType::Pub => "PUB",
            SocketType::Sub => "SUB",
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
            SocketType::Dealer => "DEALER",
            SocketType::Router => "ROUTER",
            SocketType::Pull => "PULL",
            SocketType::Push => "PUSH",
            SocketType::XPub => "XPUB",
            SocketType::XSub => "XSUB",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        let socket = match name {
            b"PAIR" => SocketType::Pair,
            b"PUB" => SocketType::Pub,
            b"SUB" => SocketType::Sub,
            b"REQ" => SocketType::Req,
            b"REP" => SocketType::Rep,
            b"DEALER" => SocketType::Dealer,
            b"ROUTER" => SocketType::Router,
            b"PULL" => SocketType::Pull,
            b"PUSH" => SocketType::Push,
            b"XPUB" => SocketType::XPub,
            b"XSUB" => SocketType::XSub,
            _ => return None,
        };
        Some(socket)
    }

    /// One-byte code used by legacy (ZMTP 2.0) greetings.
    pub fn legacy_code(&self) -> u8 {
        match self {
            SocketType::Pair => 0x00,
            SocketType::Pub | SocketType::XPub => 0x01,
            SocketType::Sub | SocketType::XSub => 0x02,
            SocketType::Req => 0x03,
            SocketType::Rep => 0x04,
            SocketType::Dealer => 0x05,
            SocketType::Router => 0x06,
            SocketType::Pull => 0x07,
            SocketType::Push => 0x08,
        }
    }

    pub fn from_legacy_code(code: u8) -> Option<Self> {
        let socket = match code {
            0x00 => SocketType::Pair,
            0x01 => SocketType::Pub,
            0x02 => SocketType::Sub,
            0x03 => SocketType::Req,
            0x04 => SocketType::Rep,
            0x05 => SocketType::Dealer,
            0x06 => SocketType::Router,
            0x07 => SocketType::Pull,
            0x08 => SocketType::Push,
            _ => return None,
        };
        Some(socket)
    }

    /// Whether a local socket of this type may talk to `peer`.
    pub fn can_pair_with(&self, peer: SocketType) -> bool {
        use SocketType::*;
        matches!(
            (self, peer),
            (Pair, Pair)
                | (Req, Rep)
                | (Req, Router)
                | (Rep, Req)
                | (Rep, Dealer)
                | (Dealer, Rep)
                | (Dealer, Dealer)
                | (Dealer, Router)
                | (Router, Req)
                | (Router, Dealer)
                | (Router, Router)
                | (Pub, Sub)
                | (Pub, XSub)
                | (XPub, Sub)
                | (XPub, XSub)
                | (Sub, Pub)
                | (Sub, XPub)
                | (XSub, Pub)
                | (XSub, XPub)
                | (Push, Pull)
                | (Pull, Push)
        )
    }

    /// Whether this socket receives subscriptions from its peers.
    pub fn accepts_subscriptions(&self) -> bool {
        matches!(self, SocketType::Pub | SocketType::XPub)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for s in [
            SocketType::Req,
            SocketType::Rep,
            SocketType::Pub,
            SocketType::Sub,
            SocketType::Router,
        ] {
            assert_eq!(SocketType::from_name(s.as_str().as_bytes()), Some(s));
        }
        assert_eq!(SocketType::from_name(b"NOPE"), None);
    }

    #[test]
    fn test_pairing() {
        assert!(SocketType::Req.can_pair_with(SocketType::Rep));
        assert!(SocketType::Rep.can_pair_with(SocketType::Req));
        assert!(SocketType::Sub.can_pair_with(SocketType::Pub));
        assert!(!SocketType::Req.can_pair_with(SocketType::Pub));
        assert!(!SocketType::Sub.can_pair_with(SocketType::Sub));
    }

    #[test]
    fn test_legacy_codes() {
        assert_eq!(SocketType::Req.legacy_code(), 0x03);
        assert_eq!(SocketType::from_legacy_code(0x04), Some(SocketType::Rep));
        assert_eq!(SocketType::from_legacy_code(0x42), None);
    }
}
