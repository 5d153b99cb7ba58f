// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP NAT session table.
//!
//! Sessions are keyed by the flow 4-tuple. For each key exactly one caller
//! (the leader) dials the outbound and writes the protocol handshake;
//! every other caller awaits the leader's one-shot outcome. A background
//! reader per session pumps return datagrams to the TUN endpoint, and a
//! sweep task evicts idle sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dialer::ProxyStream;
use crate::error::{Error, Result};
use crate::outbound::Connector;
use crate::proto::Target;

/// How long followers wait for the leader's dial+handshake.
pub const INIT_WAIT: Duration = Duration::from_secs(5);
/// Inactivity horizon after which a session is evicted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Read deadline on the outbound stream.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const DATAGRAM_BUF: usize = 65535;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Tcp,
    Udp,
}

/// NAT key. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub proto: FlowProto,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Sink for datagrams travelling back into the guest network.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    /// Stable identity of the local flow; a new flow for the same 4-tuple
    /// gets a new id.
    fn id(&self) -> u64;

    async fn send(&self, payload: &[u8]) -> Result<()>;
}

type SessionMap = Arc<DashMap<FlowKey, Arc<UdpSession>>>;

pub struct UdpSession {
    key: FlowKey,
    sessions: SessionMap,
    local: Arc<dyn DatagramSink>,
    remote_tx: Mutex<Option<WriteHalf<ProxyStream>>>,
    has_remote: AtomicBool,
    /// millis since manager start, best-effort
    last_active: AtomicU64,
    epoch: tokio::time::Instant,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    init_err: std::sync::OnceLock<String>,
    token: CancellationToken,
}

impl std::fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSession").field("key", &self.key).finish()
    }
}

impl UdpSession {
    /// Write one datagram into the tunnel.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.remote_tx.lock().await;
        let Some(remote) = guard.as_mut() else {
            return Err(Error::SessionStale);
        };
        if let Err(e) = remote.write_all(payload).await {
            drop(guard);
            self.close();
            return Err(Error::Io(e));
        }
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        self.last_active
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Remove self from the table and unwind the reader task.
    fn close(&self) {
        self.token.cancel();
        self.sessions
            .remove_if(&self.key, |_, s| s.local.id() == self.local.id());
    }
}

pub struct UdpNatManager {
    sessions: SessionMap,
    connector: Arc<dyn Connector>,
    token: CancellationToken,
    epoch: tokio::time::Instant,
}

impl UdpNatManager {
    pub fn new(connector: Arc<dyn Connector>, token: CancellationToken) -> Arc<UdpNatManager> {
        let mgr = Arc::new(UdpNatManager {
            sessions: Arc::new(DashMap::new()),
            connector,
            token,
            epoch: tokio::time::Instant::now(),
        });

        let sweeper = mgr.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });
        mgr
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remove(&self, key: FlowKey) {
        if let Some((_, session)) = self.sessions.remove(&key) {
            session.token.cancel();
        }
    }

    /// Look up or establish the session for `key`.
    ///
    /// The inserter becomes the leader and performs dial+handshake; later
    /// callers wait (capped) for the leader's published outcome.
    pub async fn get_or_create(
        &self,
        key: FlowKey,
        endpoint: Arc<dyn DatagramSink>,
        target: Target,
    ) -> Result<Arc<UdpSession>> {
        let (session, leader) = match self.sessions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let (ready_tx, ready_rx) = watch::channel(false);
                let session = Arc::new(UdpSession {
                    key,
                    sessions: self.sessions.clone(),
                    local: endpoint.clone(),
                    remote_tx: Mutex::new(None),
                    has_remote: AtomicBool::new(false),
                    last_active: AtomicU64::new(self.now_ms()),
                    epoch: self.epoch,
                    ready_tx,
                    ready_rx,
                    init_err: std::sync::OnceLock::new(),
                    token: self.token.child_token(),
                });
                v.insert(session.clone());
                (session, true)
            }
        };

        if leader {
            self.init_session(key, session.clone(), target).await?;
            return Ok(session);
        }

        // follower: await the one-shot rendezvous
        let mut ready = session.ready_rx.clone();
        let waited = tokio::select! {
            w = tokio::time::timeout(INIT_WAIT, ready.wait_for(|r| *r)) => w,
            _ = self.token.cancelled() => return Err(Error::Cancelled),
        };
        match waited {
            Err(_) => return Err(Error::SessionInitTimeout),
            Ok(Err(_)) => return Err(Error::Cancelled),
            Ok(Ok(_)) => {}
        }

        if let Some(msg) = session.init_err.get() {
            self.remove(key);
            return Err(Error::Dial(std::io::Error::other(msg.clone())));
        }
        if session.local.id() != endpoint.id() {
            // table entry belongs to a dead local flow
            self.remove(key);
            return Err(Error::SessionStale);
        }

        session.touch();
        Ok(session)
    }

    async fn init_session(
        &self,
        key: FlowKey,
        session: Arc<UdpSession>,
        target: Target,
    ) -> Result<()> {
        let dialed = tokio::select! {
            d = self.connector.connect(&target) => d,
            _ = self.token.cancelled() => Err(Error::Cancelled),
        };

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                let _ = session.init_err.set(e.to_string());
                session.ready_tx.send_replace(true);
                self.remove(key);
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *session.remote_tx.lock().await = Some(write_half);
        session.has_remote.store(true, Ordering::Release);
        session.ready_tx.send_replace(true);

        let reader = session.clone();
        let token = session.token.clone();
        tokio::spawn(async move {
            read_loop(&reader, read_half, token).await;
            reader.close();
        });

        Ok(())
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.token.cancelled() => {
                    for entry in self.sessions.iter() {
                        entry.value().token.cancel();
                    }
                    self.sessions.clear();
                    return;
                }
            }

            let now = self.now_ms();
            let idle_ms = IDLE_TIMEOUT.as_millis() as u64;
            let mut evict = Vec::new();
            for entry in self.sessions.iter() {
                let session = entry.value();
                // entries still initializing are skipped
                if !*session.ready_rx.borrow() {
                    continue;
                }
                let stale = !session.has_remote.load(Ordering::Acquire)
                    || now.saturating_sub(session.last_active.load(Ordering::Relaxed)) > idle_ms;
                if stale {
                    evict.push(*entry.key());
                }
            }
            for key in evict {
                log::debug!("udp session {} evicted", key);
                self.remove(key);
            }
        }
    }
}

/// Pump return datagrams to the local endpoint until deadline, EOF or
/// cancellation.
async fn read_loop(
    session: &UdpSession,
    mut remote: ReadHalf<ProxyStream>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let read = tokio::select! {
            r = tokio::time::timeout(READ_DEADLINE, remote.read(&mut buf)) => r,
            _ = token.cancelled() => return,
        };
        let n = match read {
            Err(_) | Ok(Ok(0)) => return,
            Ok(Err(e)) => {
                log::info!("udp session read: {}", e);
                return;
            }
            Ok(Ok(n)) => n,
        };

        if session.local.send(&buf[..n]).await.is_err() {
            return;
        }
        session.touch();
    }
}
