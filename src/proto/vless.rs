// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VLESS v0 request framing and response-header stripping.
//!
//! # Request
//!
//! | Version | UUID | Addon len | CMD | Port | ATYP | ADDR |
//! | ------- | ---- | --------- | --- | ---- | ---- | ---- |
//! |   0x00  |  16  |   0x00    | 1   | be16 |  1   | Var  |
//!
//! VLESS numbers its address types differently from SOCKS5: domain is
//! `0x02` and IPv6 is `0x03`.
//!
//! # Response
//!
//! The server's first bytes are `version(1) ‖ addon_len(1) ‖ addon`, which
//! must be consumed before payload bytes are exposed. [`VlessStream`] does
//! this lazily on the first read; some servers hold the header back until
//! upstream data exists, so consuming it during the handshake would stall
//! connection establishment.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::proto::Target;

const VERSION: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

/// Build the VLESS CONNECT request for `target`.
pub fn build_request(uuid: &[u8; 16], target: &Target) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 16 + 1 + 1 + 2 + 1 + 1 + 255);
    buf.push(VERSION);
    buf.extend_from_slice(uuid);
    buf.push(0x00); // no addons
    buf.push(CMD_CONNECT);
    buf.extend(target.port().to_be_bytes());

    match target {
        Target::Ip(SocketAddr::V4(a)) => {
            buf.push(ATYP_IPV4);
            buf.extend(a.ip().octets());
        }
        Target::Ip(SocketAddr::V6(a)) => {
            buf.push(ATYP_IPV6);
            buf.extend(a.ip().octets());
        }
        Target::Name(n, _) => {
            buf.push(ATYP_DOMAIN);
            buf.push(n.len() as u8);
            buf.extend(n.as_bytes());
        }
    }
    buf
}

/// Stream wrapper that strips the one-shot VLESS response header.
pub struct VlessStream<S> {
    inner: S,
    header: [u8; 2],
    header_read: usize,
    addon_remaining: usize,
    ready: bool,
}

impl<S> VlessStream<S> {
    pub fn new(inner: S) -> VlessStream<S> {
        VlessStream {
            inner,
            header: [0u8; 2],
            header_read: 0,
            addon_remaining: 0,
            ready: false,
        }
    }

    fn poll_strip_header(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncRead + Unpin,
    {
        while !self.ready {
            if self.header_read < 2 {
                let mut buf = ReadBuf::new(&mut self.header[self.header_read..]);
                match Pin::new(&mut self.inner).poll_read(cx, &mut buf) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                ErrorKind::UnexpectedEof,
                                "eof in vless response header",
                            )));
                        }
                        self.header_read += n;
                    }
                }
                if self.header_read < 2 {
                    continue;
                }
                if self.header[0] != VERSION {
                    return Poll::Ready(Err(io::Error::new(
                        ErrorKind::InvalidData,
                        format!("unexpected vless response version {}", self.header[0]),
                    )));
                }
                self.addon_remaining = self.header[1] as usize;
            }

            if self.addon_remaining > 0 {
                let mut discard = [0u8; 256];
                let want = self.addon_remaining.min(discard.len());
                let mut buf = ReadBuf::new(&mut discard[..want]);
                match Pin::new(&mut self.inner).poll_read(cx, &mut buf) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                ErrorKind::UnexpectedEof,
                                "eof in vless response addons",
                            )));
                        }
                        self.addon_remaining -= n;
                    }
                }
                continue;
            }

            self.ready = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for VlessStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.ready {
            match this.poll_strip_header(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for VlessStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn domain_request_bytes() {
        // uuid=11111111-1111-1111-1111-111111111111, target=example.com:443
        let uuid = [0x11; 16];
        let target = Target::new("example.com", 443).unwrap();
        let req = build_request(&uuid, &target);

        let mut expect = vec![0x00];
        expect.extend([0x11; 16]);
        expect.extend([0x00, 0x01, 0x01, 0xbb, 0x02, 0x0b]);
        expect.extend(b"example.com");
        assert_eq!(req, expect);
        assert_eq!(req.len(), 34);
    }

    #[test]
    fn atyp_differs_from_socks5() {
        let target = Target::new("example.com", 443).unwrap();
        let vless = build_request(&[0u8; 16], &target);
        let socks = target.to_socks5_bytes();
        // same host: SOCKS5 says 0x03, VLESS says 0x02
        assert_eq!(socks[0], 0x03);
        assert_eq!(vless[20], 0x02);
    }

    #[test]
    fn ipv6_atyp() {
        let target = Target::new("::1", 53).unwrap();
        let req = build_request(&[0u8; 16], &target);
        assert_eq!(req[20], 0x03);
        assert_eq!(req.len(), 1 + 16 + 1 + 1 + 2 + 1 + 16);
    }

    #[tokio::test]
    async fn strips_response_header() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut stream = VlessStream::new(client);

        server.write_all(&[0x00, 0x00]).await.unwrap();
        server.write_all(b"data").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn strips_addon_bytes() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut stream = VlessStream::new(client);

        server.write_all(&[0x00, 0x03, 1, 2, 3]).await.unwrap();
        server.write_all(b"ok").await.unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn rejects_bad_version() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut stream = VlessStream::new(client);

        server.write_all(&[0x09, 0x00, 0xff]).await.unwrap();

        let mut buf = [0u8; 1];
        assert!(stream.read_exact(&mut buf).await.is_err());
    }
}
