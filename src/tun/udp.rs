// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP datagram path.
//!
//! UDP frames never enter the smoltcp interface. The stack task parses
//! them and hands `(src, dst, payload)` to the dispatcher, which routes
//! each flow through the NAT manager (or the DNS hijack). Return
//! datagrams are re-framed as raw IP packets, checksums computed, and
//! queued for the descriptor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, UdpPacket, UdpRepr,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::nat::{DatagramSink, FlowKey, FlowProto, UdpNatManager};
use crate::outbound::Connector;
use crate::proto::Target;

use super::dns;

/// Datagrams queued per flow while its session initializes.
const FLOW_QUEUE: usize = 64;

static ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One datagram lifted off the TUN.
pub struct Datagram {
    pub key: FlowKey,
    pub payload: Bytes,
}

/// Write-back handle for one UDP flow: reverses the 4-tuple and queues a
/// complete IP frame for the descriptor.
pub struct UdpEndpoint {
    id: u64,
    key: FlowKey,
    frames: mpsc::Sender<Vec<u8>>,
}

impl UdpEndpoint {
    pub fn new(key: FlowKey, frames: mpsc::Sender<Vec<u8>>) -> UdpEndpoint {
        UdpEndpoint {
            id: ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            key,
            frames,
        }
    }
}

#[async_trait]
impl DatagramSink for UdpEndpoint {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        // reply travels dst -> src
        let frame = build_udp_frame(self.key.dst, self.key.src, payload)?;
        self.frames
            .send(frame)
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Build a checksummed IP+UDP frame from `src` to `dst`.
pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let caps = ChecksumCapabilities::default();
    let udp = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };

    match (src.ip(), dst.ip()) {
        (std::net::IpAddr::V4(sa), std::net::IpAddr::V4(da)) => {
            let ip = Ipv4Repr {
                src_addr: sa,
                dst_addr: da,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut frame = vec![0u8; ip.buffer_len() + udp.header_len() + payload.len()];
            let mut ip_pkt = Ipv4Packet::new_unchecked(&mut frame);
            ip.emit(&mut ip_pkt, &caps);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &IpAddress::Ipv4(sa),
                &IpAddress::Ipv4(da),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Ok(frame)
        }
        (std::net::IpAddr::V6(sa), std::net::IpAddr::V6(da)) => {
            let ip = Ipv6Repr {
                src_addr: sa,
                dst_addr: da,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut frame = vec![0u8; ip.buffer_len() + udp.header_len() + payload.len()];
            let mut ip_pkt = Ipv6Packet::new_unchecked(&mut frame);
            ip.emit(&mut ip_pkt);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &IpAddress::Ipv6(sa),
                &IpAddress::Ipv6(da),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Ok(frame)
        }
        _ => Err(Error::framing("mixed address families in udp flow")),
    }
}

/// Routes datagrams from the stack to NAT sessions.
///
/// Ordering within a flow is preserved by a per-flow pump task with a
/// bounded queue; the dispatcher itself never blocks on session init.
pub struct UdpRouter {
    nat: Arc<UdpNatManager>,
    connector: Arc<dyn Connector>,
    frames: mpsc::Sender<Vec<u8>>,
    vpn_mode: bool,
    token: CancellationToken,
    pumps: HashMap<FlowKey, mpsc::Sender<Bytes>>,
}

impl UdpRouter {
    pub fn new(
        nat: Arc<UdpNatManager>,
        connector: Arc<dyn Connector>,
        frames: mpsc::Sender<Vec<u8>>,
        vpn_mode: bool,
        token: CancellationToken,
    ) -> UdpRouter {
        UdpRouter {
            nat,
            connector,
            frames,
            vpn_mode,
            token,
            pumps: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut datagrams: mpsc::Receiver<Datagram>) {
        loop {
            let datagram = tokio::select! {
                d = datagrams.recv() => match d {
                    Some(d) => d,
                    None => return,
                },
                _ = self.token.cancelled() => return,
            };
            self.dispatch(datagram);
        }
    }

    fn dispatch(&mut self, datagram: Datagram) {
        let key = datagram.key;

        // DNS hijack: UDP/53 answered over a fresh outbound stream
        if self.vpn_mode && key.dst.port() == 53 {
            let connector = self.connector.clone();
            let endpoint = Arc::new(UdpEndpoint::new(key, self.frames.clone()));
            tokio::spawn(async move {
                if let Err(e) = dns::relay_query(&*connector, &datagram.payload, endpoint).await {
                    log::info!("dns hijack {}: {}", key, e);
                }
            });
            return;
        }

        let mut payload = datagram.payload;
        if let Some(pump) = self.pumps.get(&key) {
            match pump.try_send(payload) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p)) => {
                    payload = p;
                }
            }
            // pump gone or saturated; a dead pump is replaced below
            if !pump.is_closed() {
                log::debug!("udp flow {} queue full, datagram dropped", key);
                return;
            }
            self.pumps.remove(&key);
        }

        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        if tx.try_send(payload).is_err() {
            return;
        }
        self.pumps.insert(key, tx);

        let nat = self.nat.clone();
        let endpoint = Arc::new(UdpEndpoint::new(key, self.frames.clone()));
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = pump_flow(nat, key, endpoint, rx, token).await {
                log::info!("udp flow {}: {}", key, e);
            }
        });
    }
}

/// Forward queued datagrams of one flow, in order, through its session.
/// Exits once the flow has been idle past the NAT eviction horizon.
async fn pump_flow(
    nat: Arc<UdpNatManager>,
    key: FlowKey,
    endpoint: Arc<UdpEndpoint>,
    mut queue: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) -> Result<()> {
    let target = Target::from(key.dst);

    loop {
        let payload = tokio::select! {
            p = tokio::time::timeout(crate::nat::IDLE_TIMEOUT, queue.recv()) => match p {
                Ok(Some(p)) => p,
                Ok(None) | Err(_) => return Ok(()),
            },
            _ = token.cancelled() => return Ok(()),
        };

        let session = nat
            .get_or_create(key, endpoint.clone(), target.clone())
            .await?;
        session.send(&payload).await?;
    }
}

/// Parse a raw UDP-in-IP frame into a datagram. Checksums are not
/// verified.
pub fn parse_udp_frame(frame: &[u8]) -> Option<Datagram> {
    match frame.first().map(|b| b >> 4) {
        Some(4) => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            let key = FlowKey {
                src: SocketAddr::new(ip.src_addr().into(), udp.src_port()),
                dst: SocketAddr::new(ip.dst_addr().into(), udp.dst_port()),
                proto: FlowProto::Udp,
            };
            Some(Datagram {
                key,
                payload: Bytes::copy_from_slice(udp.payload()),
            })
        }
        Some(6) => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            let key = FlowKey {
                src: SocketAddr::new(ip.src_addr().into(), udp.src_port()),
                dst: SocketAddr::new(ip.dst_addr().into(), udp.dst_port()),
                proto: FlowProto::Udp,
            };
            Some(Datagram {
                key,
                payload: Bytes::copy_from_slice(udp.payload()),
            })
        }
        _ => None,
    }
}
