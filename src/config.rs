// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON configuration.
//!
//! The recognized keys mirror the outbound data model; unknown keys are
//! ignored so that host-side config files may carry extra sections.

use crate::error::{Error, Result};

/// Top level config handed to the boundary as a JSON string.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: log::LevelFilter,

    #[serde(flatten)]
    pub outbound: OutboundConfig,
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

impl Config {
    /// Parse and validate a config JSON string.
    pub fn from_json(json: &str) -> Result<Config> {
        let cfg: Config = serde_json::from_str(json).map_err(Error::config)?;
        cfg.outbound.validate()?;
        Ok(cfg)
    }
}

/// A single outbound tunnel. Immutable after load.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    pub server: String,
    pub server_port: u16,

    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub settings: Settings,
}

impl OutboundConfig {
    /// Check that the credential matching the protocol is present.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("server must not be empty"));
        }
        match self.protocol {
            Protocol::Vless => {
                if self.uuid.is_none() {
                    return Err(Error::config("vless requires uuid"));
                }
            }
            Protocol::Mandala | Protocol::Trojan | Protocol::Shadowsocks => {
                if self.password.is_none() {
                    return Err(Error::config(format!(
                        "{} requires password",
                        self.protocol
                    )));
                }
            }
            // upstream socks auth is optional, but user and password
            // must come in pairs
            Protocol::Socks => {
                if self.username.is_some() != self.password.is_some() {
                    return Err(Error::config("socks requires username with password"));
                }
            }
        }
        Ok(())
    }

    /// SNI to present: explicit `tls.server_name`, falling back to `server`.
    pub fn sni(&self) -> &str {
        match self.tls.server_name.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => &self.server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mandala,
    Vless,
    Trojan,
    Shadowsocks,
    Socks,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Mandala => "mandala",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Socks => "socks",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_name: Option<String>,
    /// Skip certificate verification.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub enable_ech: bool,
    #[serde(default)]
    pub ech_public_name: Option<String>,
    #[serde(default)]
    pub ech_doh_url: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    None,
    Ws,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Settings {
    /// TUN mode: hijack UDP/53 through the outbound.
    #[serde(default)]
    pub vpn_mode: bool,
    /// Split the first TLS record of the ClientHello.
    #[serde(default)]
    pub fragment: bool,
    #[serde(default)]
    pub fragment_size: Option<usize>,
    /// Write a junk prefix on the raw TCP connection before the transport.
    #[serde(default)]
    pub noise: bool,
    #[serde(default)]
    pub noise_size: Option<usize>,
    /// Legacy Mandala obfuscation (xorshift keystream instead of AEAD).
    #[serde(default)]
    pub legacy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let cfg = Config::from_json(
            r#"{"type":"trojan","server":"example.com","server_port":443,"password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(cfg.outbound.protocol, Protocol::Trojan);
        assert_eq!(cfg.outbound.server_port, 443);
        assert_eq!(cfg.log_level, log::LevelFilter::Info);
        assert!(!cfg.outbound.tls.enabled);
    }

    #[test]
    fn unknown_keys_ignored() {
        let cfg = Config::from_json(
            r#"{"type":"vless","server":"h","server_port":1,"uuid":"u",
                "route":{"rules":[]},"future_knob":3}"#,
        );
        assert!(cfg.is_ok());
    }

    #[test]
    fn sni_falls_back_to_server() {
        let cfg = Config::from_json(
            r#"{"type":"trojan","server":"1.2.3.4","server_port":443,"password":"pw",
                "tls":{"enabled":true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.outbound.sni(), "1.2.3.4");
    }

    #[test]
    fn missing_credential_rejected() {
        assert!(Config::from_json(r#"{"type":"vless","server":"h","server_port":1}"#).is_err());
        assert!(
            Config::from_json(r#"{"type":"socks","server":"h","server_port":1,"username":"u"}"#)
                .is_err()
        );
    }
}
