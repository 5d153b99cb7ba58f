// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client TLS configuration.
//!
//! ALPN is forced to `http/1.1` in every configuration; h2 negotiation
//! produces retry patterns middleboxes key on. The floor is TLS 1.2,
//! raised to 1.3-only when an ECHConfigList is injected. Certificate
//! verification can be disabled per config (`tls.insecure`).
//!
//! Exact ClientHello fingerprint mimicry (extension order, GREASE) is not
//! expressible with rustls; the imitation is limited to the ALPN set and
//! version range here.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::{EchConfig, EchMode};
use rustls::crypto::aws_lc_rs;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, EchConfigListBytes, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Build the rustls client config for one outbound.
pub fn client_config(tls: &TlsConfig, ech_list: Option<Vec<u8>>) -> Result<ClientConfig> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let builder = match ech_list {
        Some(list) => {
            let ech = EchConfig::new(
                EchConfigListBytes::from(list),
                aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
            )
            .map_err(|e| Error::tls(e.to_string()))?;
            // ECH implies TLS 1.3 only
            ClientConfig::builder_with_provider(provider.clone())
                .with_ech(EchMode::from(ech))
                .map_err(|e| Error::tls(e.to_string()))?
        }
        None => ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(|e| Error::tls(e.to_string()))?,
    };

    let mut config = if tls.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Parse the SNI into a rustls server name.
pub fn server_name(sni: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(sni.to_owned()).map_err(|_| Error::tls(format!("invalid sni {}", sni)))
}

/// Verifier that accepts any certificate but still checks signatures with
/// the provider, for servers fronted by private or mismatched certs.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_http11_only() {
        let cfg = client_config(&TlsConfig::default(), None).unwrap();
        assert_eq!(cfg.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn insecure_config_builds() {
        let tls = TlsConfig {
            insecure: true,
            ..Default::default()
        };
        assert!(client_config(&tls, None).is_ok());
    }

    #[test]
    fn server_name_accepts_ip_and_domain() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("1.2.3.4").is_ok());
        assert!(server_name("bad name").is_err());
    }
}
