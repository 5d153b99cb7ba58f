// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ECH config discovery over DoH.
//!
//! Resolves the `ech` SvcParam of the HTTPS record for the public name and
//! caches the raw ECHConfigList bytes process-wide. Resolution failure is
//! not fatal; the dialer degrades to non-ECH TLS.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::svcb::SvcParamValue;
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";

const DOH_TIMEOUT: Duration = Duration::from_secs(4);

/// query domain -> raw ECHConfigList. Lost races recompute the same value.
static ECH_CACHE: Lazy<DashMap<String, Vec<u8>>> = Lazy::new(DashMap::new);

/// Fetch the ECHConfigList for `domain`, consulting the cache first.
pub async fn resolve(doh_url: Option<&str>, domain: &str) -> Result<Vec<u8>> {
    if let Some(hit) = ECH_CACHE.get(domain) {
        return Ok(hit.value().clone());
    }

    let url = doh_url.unwrap_or(DEFAULT_DOH_URL);
    let list = fetch(url, domain).await?;
    ECH_CACHE.insert(domain.to_owned(), list.clone());
    Ok(list)
}

async fn fetch(doh_url: &str, domain: &str) -> Result<Vec<u8>> {
    let name = Name::from_utf8(domain).map_err(|e| Error::DnsResolve(e.to_string()))?;

    let mut msg = Message::new();
    msg.set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::HTTPS));
    let wire = msg
        .to_bytes()
        .map_err(|e| Error::DnsResolve(e.to_string()))?;

    let url = format!("{}?dns={}", doh_url, URL_SAFE_NO_PAD.encode(wire));
    let client = reqwest::Client::builder()
        .timeout(DOH_TIMEOUT)
        .build()
        .map_err(|e| Error::DnsResolve(e.to_string()))?;
    let body = client
        .get(url)
        .header("accept", "application/dns-message")
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| Error::DnsResolve(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| Error::DnsResolve(e.to_string()))?;

    let response = Message::from_vec(&body).map_err(|e| Error::DnsResolve(e.to_string()))?;
    for record in response.answers() {
        let Some(RData::HTTPS(https)) = record.data() else {
            continue;
        };
        for (_key, value) in https.svc_params() {
            if let SvcParamValue::EchConfig(ech) = value {
                if !ech.0.is_empty() {
                    return Ok(ech.0.clone());
                }
            }
        }
    }

    Err(Error::DnsResolve(format!(
        "no ech config in HTTPS record for {}",
        domain
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doh_query_is_wire_parsable() {
        let mut msg = Message::new();
        msg.set_id(0)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_utf8("example.com").unwrap(),
                RecordType::HTTPS,
            ));
        let wire = msg.to_bytes().unwrap();

        let parsed = Message::from_vec(&wire).unwrap();
        assert_eq!(parsed.queries().len(), 1);
        assert_eq!(parsed.queries()[0].query_type(), RecordType::HTTPS);
    }
}
