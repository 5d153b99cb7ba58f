// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound protocol framers.
//!
//! Every framer builds the contiguous byte buffer written as the first
//! bytes after the transport handshake. The SOCKS5-style target encoding
//! is shared; VLESS numbers its address types differently (see
//! [`vless`]).

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub mod mandala;
pub mod shadowsocks;
pub mod socks5;
pub mod trojan;
pub mod vless;

const CRLF: &[u8] = b"\r\n";

/// Destination of a proxied flow.
///
/// # Encoding
///
/// | ATYP | DST.ADDR | DST.PORT |
/// | ---- | -------- | -------- |
/// |  1   | Variable |    2     |
///
/// ATYP `0x01` is a 4-octet IPv4 address, `0x03` a length-prefixed domain
/// name, `0x04` a 16-octet IPv6 address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Ip(SocketAddr),
    Name(String, u16),
}

impl Target {
    /// Build a target from a host string, classifying IP literals.
    pub fn new(host: &str, port: u16) -> Result<Target> {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok(Target::Ip(SocketAddr::new(IpAddr::V4(v4), port)));
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return Ok(Target::Ip(SocketAddr::new(IpAddr::V6(v6), port)));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(Error::framing("domain must be 1..=255 bytes"));
        }
        Ok(Target::Name(host.to_owned(), port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Target::Ip(a) => a.port(),
            Target::Name(_, p) => *p,
        }
    }

    /// Host part as presented to DNS or dialed directly.
    pub fn host(&self) -> String {
        match self {
            Target::Ip(a) => a.ip().to_string(),
            Target::Name(n, _) => n.clone(),
        }
    }

    /// Size of the encoded `ATYP ‖ ADDR ‖ PORT` field.
    pub fn encoded_len(&self) -> usize {
        match self {
            Target::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Target::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Target::Name(n, _) => 1 + 1 + n.len() + 2,
        }
    }

    /// Append the SOCKS5-style encoding to `buf`.
    pub fn extend_socks5(&self, buf: &mut Vec<u8>) {
        match self {
            Target::Ip(SocketAddr::V4(a)) => {
                buf.push(0x01);
                buf.extend(a.ip().octets());
                buf.extend(a.port().to_be_bytes());
            }
            Target::Ip(SocketAddr::V6(a)) => {
                buf.push(0x04);
                buf.extend(a.ip().octets());
                buf.extend(a.port().to_be_bytes());
            }
            Target::Name(n, p) => {
                buf.push(0x03);
                buf.push(n.len() as u8);
                buf.extend(n.as_bytes());
                buf.extend(p.to_be_bytes());
            }
        }
    }

    pub fn to_socks5_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.extend_socks5(&mut buf);
        buf
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ip(a) => a.fmt(f),
            Target::Name(n, p) => write!(f, "{}:{}", n, p),
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::Ip(addr)
    }
}
