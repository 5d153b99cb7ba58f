// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound transport dialer.
//!
//! Layers, innermost first: TCP connect (5 s budget), optional junk-byte
//! noise prefix, optional TLS (with ECH and ClientHello fragmentation),
//! optional WebSocket. Each layer is erased to [`ProxyStream`] so the
//! protocol framers see one byte-stream shape.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{OutboundConfig, TransportKind};
use crate::error::{Error, Result};

pub mod ech;
pub mod fragment;
pub mod tls;
pub mod ws;

use fragment::FragmentStream;

/// Combined async read/write supertrait so it can be used as a single trait object.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Established outbound byte stream.
pub type ProxyStream = Box<dyn AsyncReadWrite>;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_NOISE_LEN: usize = 16;
const MAX_NOISE_LEN: usize = 1024;

/// Dials the configured server and brings up the transport layers.
pub struct Dialer {
    cfg: Arc<OutboundConfig>,
}

impl Dialer {
    pub fn new(cfg: Arc<OutboundConfig>) -> Dialer {
        Dialer { cfg }
    }

    /// Open a transport-ready stream to the configured server.
    pub async fn dial(&self) -> Result<ProxyStream> {
        let cfg = &self.cfg;

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((cfg.server.as_str(), cfg.server_port)),
        )
        .await
        .map_err(|_| Error::Dial(std::io::ErrorKind::TimedOut.into()))?
        .map_err(Error::Dial)?;
        let _ = tcp.set_nodelay(true);

        let mut stream: ProxyStream = Box::new(tcp);

        // junk prefix, discarded by servers configured for it
        if cfg.settings.noise {
            let len = cfg
                .settings
                .noise_size
                .unwrap_or(DEFAULT_NOISE_LEN)
                .clamp(1, MAX_NOISE_LEN);
            let mut junk = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut junk);
            stream.write_all(&junk).await.map_err(Error::HandshakeIo)?;
        }

        if cfg.tls.enabled {
            stream = self.handshake_tls(stream).await?;
        }

        if cfg.transport.kind == TransportKind::Ws {
            let host = cfg.sni().to_owned();
            let upgraded = ws::upgrade(
                stream,
                &host,
                cfg.transport.path.as_deref(),
                &cfg.transport.headers,
            )
            .await?;
            stream = Box::new(upgraded);
        }

        Ok(stream)
    }

    async fn handshake_tls(&self, stream: ProxyStream) -> Result<ProxyStream> {
        let cfg = &self.cfg;
        let sni = cfg.sni().to_owned();

        // ECH failure degrades to plain TLS 1.2+
        let ech_list = if cfg.tls.enable_ech {
            let query = match cfg.tls.ech_public_name.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => sni.as_str(),
            };
            match ech::resolve(cfg.tls.ech_doh_url.as_deref(), query).await {
                Ok(list) => Some(list),
                Err(e) => {
                    log::warn!("[{}] ech resolve failed, degrading: {}", cfg.tag, e);
                    None
                }
            }
        } else {
            None
        };

        let tls_config = tls::client_config(&cfg.tls, ech_list)?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let name = tls::server_name(&sni)?;

        let connect = |s: ProxyStream| connector.connect(name, s);
        let stream = if cfg.settings.fragment {
            let wrapped: ProxyStream =
                Box::new(FragmentStream::new(stream, cfg.settings.fragment_size));
            connect(wrapped).await
        } else {
            connect(stream).await
        }
        .map_err(|e| Error::tls(e.to_string()))?;

        Ok(Box::new(stream))
    }
}
