// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The configured outbound tunnel.
//!
//! [`Connector::connect`] yields a byte stream that is already past the
//! transport and protocol handshakes: the first application byte written
//! lands inside the tunnel. The trait seam exists so the flow handler,
//! the UDP NAT and the DNS hijack path can be exercised against scripted
//! outbounds in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::{OutboundConfig, Protocol};
use crate::crypto;
use crate::dialer::{Dialer, ProxyStream};
use crate::error::{Error, Result};
use crate::proto::{mandala, shadowsocks, socks5, trojan, vless, Target};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the outbound and complete the per-protocol handshake for
    /// `target`.
    async fn connect(&self, target: &Target) -> Result<ProxyStream>;
}

pub struct Outbound {
    cfg: Arc<OutboundConfig>,
    dialer: Dialer,
    /// parsed once; only present for vless
    uuid: Option<[u8; 16]>,
    /// derived once via the process-wide key cache; only for mandala
    mandala_key: Option<[u8; 32]>,
}

impl Outbound {
    pub fn new(cfg: OutboundConfig) -> Result<Outbound> {
        let cfg = Arc::new(cfg);

        let uuid = match (cfg.protocol, cfg.uuid.as_deref()) {
            (Protocol::Vless, Some(raw)) => Some(crypto::parse_uuid(raw)?),
            (Protocol::Vless, None) => return Err(Error::config("vless requires uuid")),
            _ => None,
        };

        let mandala_key = match cfg.protocol {
            Protocol::Mandala if !cfg.settings.legacy => {
                let password = cfg
                    .password
                    .as_deref()
                    .ok_or_else(|| Error::config("mandala requires password"))?;
                Some(crypto::mandala_key(password))
            }
            _ => None,
        };

        Ok(Outbound {
            dialer: Dialer::new(cfg.clone()),
            cfg,
            uuid,
            mandala_key,
        })
    }

    fn password(&self) -> Result<&str> {
        self.cfg
            .password
            .as_deref()
            .ok_or_else(|| Error::config("password missing"))
    }
}

#[async_trait]
impl Connector for Outbound {
    async fn connect(&self, target: &Target) -> Result<ProxyStream> {
        let mut stream = self.dialer.dial().await?;

        match self.cfg.protocol {
            Protocol::Mandala => {
                if self.cfg.settings.legacy {
                    let password = self.password()?;
                    let (packet, salt, write_key) =
                        mandala::build_legacy_request(password, target);
                    stream
                        .write_all(&packet)
                        .await
                        .map_err(Error::HandshakeIo)?;
                    let wrapped = mandala::LegacyStream::new(stream, password, &salt, write_key);
                    return Ok(Box::new(wrapped));
                }
                let key = self
                    .mandala_key
                    .as_ref()
                    .ok_or_else(|| Error::config("mandala key missing"))?;
                let packet = mandala::build_request(key, target)?;
                stream
                    .write_all(&packet)
                    .await
                    .map_err(Error::HandshakeIo)?;
            }
            Protocol::Vless => {
                let uuid = self
                    .uuid
                    .as_ref()
                    .ok_or_else(|| Error::config("vless uuid missing"))?;
                let request = vless::build_request(uuid, target);
                stream
                    .write_all(&request)
                    .await
                    .map_err(Error::HandshakeIo)?;
                // response header is stripped lazily on first read
                return Ok(Box::new(vless::VlessStream::new(stream)));
            }
            Protocol::Trojan => {
                let request = trojan::build_request(self.password()?, target);
                stream
                    .write_all(&request)
                    .await
                    .map_err(Error::HandshakeIo)?;
            }
            Protocol::Shadowsocks => {
                let request = shadowsocks::build_request(target);
                stream
                    .write_all(&request)
                    .await
                    .map_err(Error::HandshakeIo)?;
            }
            Protocol::Socks => {
                let auth = match (self.cfg.username.as_deref(), self.cfg.password.as_deref()) {
                    (Some(u), Some(p)) => Some((u, p)),
                    _ => None,
                };
                socks5::client_handshake(&mut stream, target, auth).await?;
            }
        }

        Ok(stream)
    }
}
