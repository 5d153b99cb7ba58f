// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS over the outbound.
//!
//! In VPN mode, guest UDP/53 queries are answered through a fresh
//! outbound stream instead of leaking to the local resolver: the query is
//! wrapped as DNS-over-TCP (`len(be16) ‖ query`), sent through the tunnel
//! to the upstream resolver, and the response is written back on the UDP
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::nat::DatagramSink;
use crate::outbound::Connector;
use crate::proto::Target;

/// Upstream resolver dialed through the outbound.
pub const UPSTREAM_RESOLVER: (&str, u16) = ("223.5.5.5", 53);

/// Whole-exchange budget.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Per read/write budget on the tunnel.
const IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Relay one query and write the response back to `endpoint`.
pub async fn relay_query(
    connector: &dyn Connector,
    query: &[u8],
    endpoint: Arc<dyn DatagramSink>,
) -> Result<()> {
    tokio::time::timeout(TOTAL_TIMEOUT, exchange(connector, query, endpoint))
        .await
        .map_err(|_| Error::SessionInitTimeout)?
}

async fn exchange(
    connector: &dyn Connector,
    query: &[u8],
    endpoint: Arc<dyn DatagramSink>,
) -> Result<()> {
    if query.len() > u16::MAX as usize {
        return Err(Error::framing("oversized dns query"));
    }

    let target = Target::new(UPSTREAM_RESOLVER.0, UPSTREAM_RESOLVER.1)?;
    let mut stream = connector.connect(&target).await?;

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend((query.len() as u16).to_be_bytes());
    framed.extend(query);
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(&framed))
        .await
        .map_err(|_| Error::SessionInitTimeout)?
        .map_err(Error::Io)?;

    let mut len = [0u8; 2];
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut len))
        .await
        .map_err(|_| Error::SessionInitTimeout)?
        .map_err(Error::Io)?;
    let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut response))
        .await
        .map_err(|_| Error::SessionInitTimeout)?
        .map_err(Error::Io)?;

    endpoint.send(&response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::duplex;

    use crate::dialer::ProxyStream;

    struct ScriptedConnector;

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, target: &Target) -> Result<ProxyStream> {
            assert_eq!(target.host(), "223.5.5.5");
            assert_eq!(target.port(), 53);

            let (mut server, client) = duplex(512);
            tokio::spawn(async move {
                let mut len = [0u8; 2];
                server.read_exact(&mut len).await.unwrap();
                let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
                server.read_exact(&mut query).await.unwrap();
                assert_eq!(query, b"fake-query");

                let response = b"fake-response";
                server
                    .write_all(&(response.len() as u16).to_be_bytes())
                    .await
                    .unwrap();
                server.write_all(response).await.unwrap();
            });
            Ok(Box::new(client))
        }
    }

    struct CaptureSink(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl DatagramSink for CaptureSink {
        fn id(&self) -> u64 {
            1
        }

        async fn send(&self, payload: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn query_round_trips_over_outbound() {
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        relay_query(&ScriptedConnector, b"fake-query", sink.clone())
            .await
            .unwrap();

        let got = sink.0.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], b"fake-response");
    }
}
