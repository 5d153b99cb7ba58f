// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loopback SOCKS5 end to end: greeting, CONNECT, relay, failure reply.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use mandala_x::dialer::ProxyStream;
use mandala_x::error::{Error, Result};
use mandala_x::outbound::Connector;
use mandala_x::proto::Target;
use mandala_x::socks::SocksServer;

/// Outbound that echoes everything written into the tunnel.
struct EchoConnector;

#[async_trait]
impl Connector for EchoConnector {
    async fn connect(&self, target: &Target) -> Result<ProxyStream> {
        assert_eq!(target.port(), 443);

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if far.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(near))
    }
}

struct FailingConnector;

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, _target: &Target) -> Result<ProxyStream> {
        Err(Error::Dial(std::io::Error::other("no route")))
    }
}

#[tokio::test]
async fn connect_and_echo_through_proxy() {
    let token = CancellationToken::new();
    let server = SocksServer::bind(0, Arc::new(EchoConnector), token.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(addr).await.unwrap();

    // greeting
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    // CONNECT example.com:443
    let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
    req.extend(b"example.com");
    req.extend(443u16.to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    // payload round trip
    let payload = vec![0x5au8; 128 * 1024];
    client.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    token.cancel();
}

#[tokio::test]
async fn dial_failure_answers_host_unreachable() {
    let token = CancellationToken::new();
    let server = SocksServer::bind(0, Arc::new(FailingConnector), token.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x01, 0xbb])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x04);

    token.cancel();
}

#[tokio::test]
async fn rejects_auth_only_clients() {
    let token = CancellationToken::new();
    let server = SocksServer::bind(0, Arc::new(FailingConnector), token.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    // only USER/PASS offered
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0xff]);

    token.cancel();
}
