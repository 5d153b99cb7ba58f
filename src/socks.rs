// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loopback SOCKS5 inbound.
//!
//! Minimal RFC 1928 acceptor: NO AUTH only, CONNECT only. Each accepted
//! connection is handed to the flow relay; dial failures answer
//! `REP 0x04` instead of resetting.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::outbound::Connector;
use crate::proto::socks5;
use crate::relay;

pub struct SocksServer {
    listener: TcpListener,
    connector: Arc<dyn Connector>,
    token: CancellationToken,
}

impl SocksServer {
    /// Bind the loopback listener. Failures surface before the boundary
    /// call returns.
    pub async fn bind(
        port: u16,
        connector: Arc<dyn Connector>,
        token: CancellationToken,
    ) -> Result<SocksServer> {
        let bind = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(bind).await?;
        log::info!("socks5 listening on {}", bind);
        Ok(SocksServer {
            listener,
            connector,
            token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, src) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        log::error!("socks accept: {}", e);
                        continue;
                    }
                },
                _ = self.token.cancelled() => return Err(Error::Cancelled),
            };

            let connector = self.connector.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    r = serve(connector, stream) => {
                        if let Err(e) = r {
                            log::info!("socks session from {}: {}", src, e);
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
    }
}

async fn serve(connector: Arc<dyn Connector>, mut stream: TcpStream) -> Result<()> {
    // greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.map_err(Error::HandshakeIo)?;
    if head[0] != socks5::VERSION || head[1] == 0 {
        return Err(Error::framing("bad socks5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(Error::HandshakeIo)?;

    if !methods.contains(&socks5::METHOD_NO_AUTH) {
        let _ = stream
            .write_all(&[socks5::VERSION, socks5::METHOD_NO_ACCEPTABLE])
            .await;
        return Err(Error::framing("client insists on auth"));
    }
    stream
        .write_all(&[socks5::VERSION, socks5::METHOD_NO_AUTH])
        .await
        .map_err(Error::HandshakeIo)?;

    let target = socks5::read_request(&mut stream).await?;
    log::debug!("socks connect {}", target);

    let remote = match connector.connect(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = stream
                .write_all(&socks5::reply(socks5::REP_HOST_UNREACHABLE))
                .await;
            return Err(e);
        }
    };

    stream
        .write_all(&socks5::reply(socks5::REP_SUCCESS))
        .await
        .map_err(Error::HandshakeIo)?;

    relay::tune_local_socket(&stream, true);
    let (up, down) = relay::relay(stream, remote).await?;
    log::debug!("socks session {} done, up {} down {}", target, up, down);
    Ok(())
}
