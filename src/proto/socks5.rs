// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SOCKS5 wire helpers (RFC 1928, RFC 1929).
//!
//! [`client_handshake`] drives the live multi-step exchange against an
//! upstream SOCKS5 server. The request/reply codecs are shared with the
//! loopback inbound listener.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proto::Target;

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;

/// Negotiate methods, optionally authenticate, CONNECT to `target` and
/// consume the full reply. On return the stream carries payload bytes.
pub async fn client_handshake<S>(
    stream: &mut S,
    target: &Target,
    auth: Option<(&str, &str)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // method negotiation
    let greeting: &[u8] = match auth {
        Some(_) => &[VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS],
        None => &[VERSION, 0x01, METHOD_NO_AUTH],
    };
    stream.write_all(greeting).await.map_err(Error::HandshakeIo)?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(Error::HandshakeIo)?;
    if choice[0] != VERSION {
        return Err(Error::framing("upstream is not socks5"));
    }

    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let (user, pass) = auth.ok_or_else(|| {
                Error::framing("upstream requires auth but no credentials configured")
            })?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::framing("username/password longer than 255 bytes"));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01); // subnegotiation version
            req.push(user.len() as u8);
            req.extend(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend(pass.as_bytes());
            stream.write_all(&req).await.map_err(Error::HandshakeIo)?;

            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .map_err(Error::HandshakeIo)?;
            if status[1] != 0x00 {
                return Err(Error::framing("upstream rejected credentials"));
            }
        }
        _ => return Err(Error::framing("no acceptable auth method")),
    }

    // CONNECT
    let mut req = Vec::with_capacity(3 + target.encoded_len());
    req.extend([VERSION, CMD_CONNECT, 0x00]);
    target.extend_socks5(&mut req);
    stream.write_all(&req).await.map_err(Error::HandshakeIo)?;

    // reply header, then BND.ADDR/BND.PORT by ATYP
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(Error::HandshakeIo)?;
    if head[0] != VERSION {
        return Err(Error::framing("malformed connect reply"));
    }
    if head[1] != REP_SUCCESS {
        return Err(Error::framing(format!(
            "upstream connect failed, rep={:#04x}",
            head[1]
        )));
    }
    let bnd_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(Error::HandshakeIo)?;
            len[0] as usize
        }
        _ => return Err(Error::framing("unknown atyp in connect reply")),
    };
    let mut bnd = vec![0u8; bnd_len + 2];
    stream
        .read_exact(&mut bnd)
        .await
        .map_err(Error::HandshakeIo)?;

    Ok(())
}

/// Read an inbound CONNECT request after method selection. Returns the
/// requested target.
pub async fn read_request<S>(stream: &mut S) -> Result<Target>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(Error::HandshakeIo)?;
    if head[0] != VERSION {
        return Err(Error::framing("not a socks5 request"));
    }
    if head[1] != CMD_CONNECT {
        return Err(Error::framing("only CONNECT is supported"));
    }

    let target = match head[3] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.map_err(Error::HandshakeIo)?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Target::Ip((IpAddr::V4(ip), port).into())
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await.map_err(Error::HandshakeIo)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Target::Ip((IpAddr::V6(ip), port).into())
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(Error::HandshakeIo)?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await.map_err(Error::HandshakeIo)?;
            let name = std::str::from_utf8(&buf[..len[0] as usize])
                .map_err(|_| Error::framing("domain is not utf-8"))?;
            let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
            Target::new(name, port)?
        }
        _ => return Err(Error::framing("unknown atyp in request")),
    };
    Ok(target)
}

/// `05 <rep> 00 01 0.0.0.0:0` reply sent to inbound clients.
pub fn reply(rep: u8) -> [u8; 10] {
    [VERSION, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Seed case: username="u", password="p", scripted upstream.
    #[tokio::test]
    async fn handshake_with_userpass() {
        let (mut server, mut client) = duplex(256);
        let target = Target::new("1.2.3.4", 80).unwrap();

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 5];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth, [0x01, 0x01, b'u', 0x01, b'p']);
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&req[4..8], &[1, 2, 3, 4]);
            assert_eq!(&req[8..10], &[0x00, 0x50]);
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 9, 9, 9, 9, 0x1f, 0x90])
                .await
                .unwrap();

            // prove the reply was fully consumed: next byte is payload
            server.write_all(b"!").await.unwrap();
            server
        });

        client_handshake(&mut client, &target, Some(("u", "p")))
            .await
            .unwrap();
        let mut b = [0u8; 1];
        client.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"!");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_no_auth_domain_reply() {
        let (mut server, mut client) = duplex(256);
        let target = Target::new("example.com", 443).unwrap();

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..5], &[0x05, 0x01, 0x00, 0x03, 11]);

            // reply with a domain-typed BND address
            let mut rep = vec![0x05, 0x00, 0x00, 0x03, 4];
            rep.extend(b"home");
            rep.extend([0x00, 0x50]);
            server.write_all(&rep).await.unwrap();
            server.write_all(b"?").await.unwrap();
            server
        });

        client_handshake(&mut client, &target, None).await.unwrap();
        let mut b = [0u8; 1];
        client.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"?");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (mut server, mut client) = duplex(256);
        let target = Target::new("1.2.3.4", 80).unwrap();

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        assert!(client_handshake(&mut client, &target, None).await.is_err());
    }

    #[tokio::test]
    async fn request_codec_round_trip() {
        let (mut a, mut b) = duplex(256);
        let target = Target::new("example.com", 443).unwrap();

        let mut req = vec![VERSION, CMD_CONNECT, 0x00];
        target.extend_socks5(&mut req);
        a.write_all(&req).await.unwrap();

        let parsed = read_request(&mut b).await.unwrap();
        assert_eq!(parsed, target);
    }
}
