// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP NAT behavior: single-flight init, shared failure, stale endpoints
//! and idle eviction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mandala_x::dialer::ProxyStream;
use mandala_x::error::{Error, Result};
use mandala_x::nat::{DatagramSink, FlowKey, FlowProto, UdpNatManager};
use mandala_x::outbound::Connector;
use mandala_x::proto::Target;

fn key() -> FlowKey {
    FlowKey {
        src: "10.0.0.2:40000".parse::<SocketAddr>().unwrap(),
        dst: "1.1.1.1:53".parse::<SocketAddr>().unwrap(),
        proto: FlowProto::Udp,
    }
}

struct MockSink {
    id: u64,
    received: AtomicUsize,
}

impl MockSink {
    fn new(id: u64) -> Arc<MockSink> {
        Arc::new(MockSink {
            id,
            received: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DatagramSink for MockSink {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&self, _payload: &[u8]) -> Result<()> {
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Dialer that counts connects and discards tunnel bytes on the far side.
struct CountingConnector {
    dials: AtomicUsize,
    delay: Duration,
    fail: bool,
    bytes_seen: Arc<AtomicUsize>,
}

impl CountingConnector {
    fn new(delay: Duration, fail: bool) -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            delay,
            fail,
            bytes_seen: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, _target: &Target) -> Result<ProxyStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::Dial(std::io::Error::other("refused")));
        }

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let seen = self.bytes_seen.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 4096];
            while let Ok(n) = far.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                seen.fetch_add(n, Ordering::SeqCst);
            }
        });
        Ok(Box::new(near))
    }
}

/// Ten concurrent datagram arrivals for one 4-tuple dial exactly once;
/// every caller sees the same live session and completes its write.
#[tokio::test(start_paused = true)]
async fn burst_is_single_flight() {
    let connector = CountingConnector::new(Duration::from_millis(100), false);
    let token = CancellationToken::new();
    let mgr = UdpNatManager::new(connector.clone(), token.clone());
    let sink = MockSink::new(7);

    let mut tasks = Vec::new();
    for i in 0..10u8 {
        let mgr = mgr.clone();
        let sink = sink.clone();
        tasks.push(tokio::spawn(async move {
            let session = mgr
                .get_or_create(key(), sink, Target::new("1.1.1.1", 53).unwrap())
                .await?;
            session.send(&[i; 32]).await
        }));
    }

    for task in tasks {
        task.await.unwrap().expect("caller failed");
    }

    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.len(), 1);

    // all ten datagrams made it into the tunnel
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.bytes_seen.load(Ordering::SeqCst), 10 * 32);

    token.cancel();
}

/// All waiters observe the leader's failure and the entry is gone.
#[tokio::test(start_paused = true)]
async fn leader_failure_is_shared() {
    let connector = CountingConnector::new(Duration::from_millis(50), true);
    let token = CancellationToken::new();
    let mgr = UdpNatManager::new(connector.clone(), token.clone());
    let sink = MockSink::new(1);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let mgr = mgr.clone();
        let sink = sink.clone();
        tasks.push(tokio::spawn(async move {
            mgr.get_or_create(key(), sink, Target::new("1.1.1.1", 53).unwrap())
                .await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.len(), 0);

    token.cancel();
}

/// A lookup with a different local endpoint evicts the dead entry.
#[tokio::test(start_paused = true)]
async fn stale_endpoint_is_evicted() {
    let connector = CountingConnector::new(Duration::from_millis(1), false);
    let token = CancellationToken::new();
    let mgr = UdpNatManager::new(connector.clone(), token.clone());

    let first = MockSink::new(1);
    let _session = mgr
        .get_or_create(key(), first, Target::new("1.1.1.1", 53).unwrap())
        .await
        .unwrap();

    let second = MockSink::new(2);
    let err = mgr
        .get_or_create(key(), second.clone(), Target::new("1.1.1.1", 53).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionStale));
    assert_eq!(mgr.len(), 0);

    // the retried lookup becomes a fresh leader
    mgr.get_or_create(key(), second, Target::new("1.1.1.1", 53).unwrap())
        .await
        .unwrap();
    assert_eq!(connector.dials.load(Ordering::SeqCst), 2);

    token.cancel();
}

/// Sessions idle past the horizon are removed by the sweep.
#[tokio::test(start_paused = true)]
async fn idle_session_is_swept() {
    let connector = CountingConnector::new(Duration::from_millis(1), false);
    let token = CancellationToken::new();
    let mgr = UdpNatManager::new(connector.clone(), token.clone());
    let sink = MockSink::new(1);

    let session = mgr
        .get_or_create(key(), sink, Target::new("1.1.1.1", 53).unwrap())
        .await
        .unwrap();
    session.send(b"one datagram").await.unwrap();
    drop(session);
    assert_eq!(mgr.len(), 1);

    // beyond 60 s idle plus a sweep period
    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(mgr.len(), 0);

    token.cancel();
}
