// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-space L3 stack over the platform TUN descriptor.
//!
//! One task owns the smoltcp interface, the socket set and the fd. TCP is
//! terminated by the interface: a sniffed SYN to an unknown 4-tuple
//! creates a listening socket on exactly that endpoint, the handshake
//! completes with SYN-ACK, and the flow is delivered as a [`TcpFlow`].
//! SYNs that cannot get a socket are answered with RST by the interface.
//! UDP bypasses the interface entirely and is routed as datagrams
//! ([`udp`]).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv6Address, Ipv6Packet, TcpPacket,
};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::nat::{FlowKey, FlowProto};

pub mod device;
pub mod dns;
pub mod udp;

mod tcp_stream;

pub use tcp_stream::{TcpFlow, TunTcpStream};

use device::{TunFd, VirtDevice};
use tcp_stream::FlowEntry;

/// Upper bound on concurrent flows.
const TCP_BACKLOG: usize = 30000;
/// Handshakes allowed in flight at once.
const SYN_IN_FLIGHT: usize = 10;

const TCP_RX_BUF: usize = 64 * 1024;
const TCP_TX_BUF: usize = 64 * 1024;
const RECV_CHUNK: usize = 4096;

const ACCEPT_QUEUE: usize = 512;
const DATAGRAM_QUEUE: usize = 512;
const FRAME_QUEUE: usize = 512;

/// Handles the rest of the core uses to talk to the stack task.
pub struct TunStack {
    /// established TCP flows
    pub accepts: mpsc::Receiver<TcpFlow>,
    /// raw UDP datagrams
    pub datagrams: mpsc::Receiver<udp::Datagram>,
    /// reply frames going back out the descriptor
    pub frames: mpsc::Sender<Vec<u8>>,
}

/// Bind the stack to `fd` and spawn its task.
pub fn spawn(fd: RawFd, mtu: usize, token: CancellationToken) -> io::Result<TunStack> {
    let fd = TunFd::new(fd)?;
    let mut dev = VirtDevice::new(mtu);

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = rand::random();
    let mut iface = Interface::new(config, &mut dev, SmolInstant::now());

    // single nic, promiscuous, default routes both families
    iface.set_any_ip(true);
    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(IpAddress::v4(10, 255, 0, 1), 32));
        let _ = addrs.push(IpCidr::new(IpAddress::v6(0xfd00, 0, 0, 0, 0, 0, 0, 1), 128));
    });
    let _ = iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Address::new(10, 255, 0, 1));
    let _ = iface
        .routes_mut()
        .add_default_ipv6_route(Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));

    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
    let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);

    let task = StackTask {
        fd,
        dev,
        iface,
        sockets: SocketSet::new(Vec::new()),
        flows: HashMap::new(),
        by_key: HashMap::new(),
        pending_handshakes: 0,
        accept_tx,
        datagram_tx,
        frames_rx: frame_rx,
        // keeps the frame channel open even if every endpoint handle dies
        frames_tx: frame_tx.clone(),
        notify: Arc::new(Notify::new()),
        token,
        mtu,
    };
    tokio::spawn(task.run());

    Ok(TunStack {
        accepts: accept_rx,
        datagrams: datagram_rx,
        frames: frame_tx,
    })
}

struct StackTask {
    fd: TunFd,
    dev: VirtDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    flows: HashMap<SocketHandle, FlowEntry>,
    by_key: HashMap<FlowKey, SocketHandle>,
    pending_handshakes: usize,
    accept_tx: mpsc::Sender<TcpFlow>,
    datagram_tx: mpsc::Sender<udp::Datagram>,
    frames_rx: mpsc::Receiver<Vec<u8>>,
    #[allow(dead_code)]
    frames_tx: mpsc::Sender<Vec<u8>>,
    notify: Arc<Notify>,
    token: CancellationToken,
    mtu: usize,
}

impl StackTask {
    async fn run(mut self) {
        let mut rx_buf = vec![0u8; self.mtu.max(1500)];
        log::info!("tun stack up, mtu {}", self.mtu);

        loop {
            let ts = SmolInstant::now();
            let _ = self.iface.poll(ts, &mut self.dev, &mut self.sockets);
            self.service_flows();
            self.flush_tx().await;

            // poll again immediately while inbound frames are queued
            if self.dev.has_rx() {
                continue;
            }

            let delay = self
                .iface
                .poll_delay(ts, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()));

            tokio::select! {
                _ = self.token.cancelled() => break,
                read = self.fd.read_frame(&mut rx_buf) => match read {
                    Ok(0) => {
                        log::info!("tun fd closed");
                        break;
                    }
                    Ok(n) => {
                        let frame = rx_buf[..n].to_vec();
                        self.handle_frame(frame);
                    }
                    Err(e) => {
                        log::error!("tun read: {}", e);
                        break;
                    }
                },
                frame = self.frames_rx.recv() => {
                    if let Some(frame) = frame {
                        if let Err(e) = self.fd.write_frame(&frame).await {
                            log::debug!("tun write: {}", e);
                        }
                        while let Ok(frame) = self.frames_rx.try_recv() {
                            if let Err(e) = self.fd.write_frame(&frame).await {
                                log::debug!("tun write: {}", e);
                                break;
                            }
                        }
                    }
                },
                _ = self.notify.notified() => {}
                _ = maybe_sleep(delay) => {}
            }
        }

        log::info!("tun stack down");
        // dropping channels unwinds flow tasks; dropping TunFd closes the fd
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        match classify(&frame) {
            Some(IpProtocol::Udp) => {
                if let Some(datagram) = udp::parse_udp_frame(&frame) {
                    if self.datagram_tx.try_send(datagram).is_err() {
                        log::debug!("udp queue full, datagram dropped");
                    }
                }
            }
            Some(IpProtocol::Tcp) => {
                self.maybe_listen(&frame);
                self.dev.push_rx(frame);
            }
            Some(_) => self.dev.push_rx(frame),
            None => {}
        }
    }

    /// Create a listening socket for a fresh SYN so the interface can
    /// complete the handshake. Without a socket the interface answers RST.
    fn maybe_listen(&mut self, frame: &[u8]) {
        let Some((key, syn_only)) = sniff_tcp(frame) else {
            return;
        };
        if !syn_only || self.by_key.contains_key(&key) {
            return;
        }
        if self.flows.len() >= TCP_BACKLOG {
            log::warn!("flow table full, resetting {}", key);
            return;
        }
        if self.pending_handshakes >= SYN_IN_FLIGHT {
            return;
        }

        let mut sock = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF]),
            tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF]),
        );
        sock.set_nagle_enabled(false);

        let endpoint = IpListenEndpoint {
            addr: Some(key.dst.ip().into()),
            port: key.dst.port(),
        };
        if sock.listen(endpoint).is_err() {
            return;
        }

        let handle = self.sockets.add(sock);
        self.flows
            .insert(handle, FlowEntry::new(key, self.notify.clone()));
        self.by_key.insert(key, handle);
        self.pending_handshakes += 1;
        log::debug!("tcp flow {} accepted", key);
    }

    fn service_flows(&mut self) {
        let mut dead = Vec::new();

        for (&handle, entry) in self.flows.iter_mut() {
            let sock = self.sockets.get_mut::<tcp::Socket>(handle);

            if !entry.established {
                match sock.state() {
                    tcp::State::Established => {
                        entry.established = true;
                        self.pending_handshakes -= 1;
                        if let Some(flow) = entry.staged.take() {
                            if self.accept_tx.try_send(flow).is_err() {
                                log::warn!("accept queue full, resetting {}", entry.key);
                                sock.abort();
                                dead.push(handle);
                                continue;
                            }
                        }
                    }
                    tcp::State::Closed => {
                        self.pending_handshakes -= 1;
                        dead.push(handle);
                        continue;
                    }
                    _ => continue,
                }
            }

            pump_socket(entry, sock);

            if sock.state() == tcp::State::Closed {
                dead.push(handle);
            }
        }

        for handle in dead {
            self.remove_flow(handle);
        }
    }

    fn remove_flow(&mut self, handle: SocketHandle) {
        if let Some(entry) = self.flows.remove(&handle) {
            self.by_key.remove(&entry.key);
            log::debug!("tcp flow {} closed", entry.key);
        }
        self.sockets.remove(handle);
    }

    async fn flush_tx(&mut self) {
        while let Some(frame) = self.dev.pop_tx() {
            if let Err(e) = self.fd.write_frame(&frame).await {
                log::debug!("tun write: {}", e);
                return;
            }
        }
    }
}

/// Move bytes between one socket and its flow channels.
fn pump_socket(entry: &mut FlowEntry, sock: &mut tcp::Socket) {
    // guest -> flow
    loop {
        let Some(tx) = entry.to_flow.as_ref() else {
            break;
        };
        if tx.is_closed() {
            entry.reader_gone = true;
            entry.to_flow = None;
            break;
        }
        if !sock.can_recv() {
            break;
        }
        let mut closed = false;
        match tx.try_reserve() {
            Ok(permit) => {
                let mut chunk = [0u8; RECV_CHUNK];
                match sock.recv_slice(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => permit.send(Bytes::copy_from_slice(&chunk[..n])),
                }
            }
            Err(mpsc::error::TrySendError::Full(())) => break,
            Err(mpsc::error::TrySendError::Closed(())) => {
                closed = true;
            }
        }
        if closed {
            entry.reader_gone = true;
            entry.to_flow = None;
            break;
        }
    }

    // guest FIN, fully drained: drop the sender so the flow reads EOF
    if entry.to_flow.is_some() && !sock.may_recv() && !sock.can_recv() {
        entry.to_flow = None;
    }

    // flow -> guest
    loop {
        if entry.pending.is_none() {
            match entry.from_flow.try_recv() {
                Ok(chunk) => entry.pending = Some(chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    entry.writer_gone = true;
                    break;
                }
            }
        }
        let Some(chunk) = entry.pending.as_mut() else {
            break;
        };
        if !sock.can_send() {
            break;
        }
        match sock.send_slice(chunk) {
            Ok(n) if n == chunk.len() => entry.pending = None,
            Ok(n) => {
                chunk.advance(n);
                break;
            }
            Err(_) => {
                entry.pending = None;
                entry.writer_gone = true;
                break;
            }
        }
    }

    if entry.writer_gone && entry.pending.is_none() && !entry.fin_sent {
        // half-close towards the guest once queued bytes are out
        sock.close();
        entry.fin_sent = true;
    }

    if entry.reader_gone && entry.writer_gone && !entry.fin_sent {
        // flow dropped without shutdown: reset
        sock.abort();
        entry.fin_sent = true;
    }
}

/// First-nibble IP version plus transport protocol.
fn classify(frame: &[u8]) -> Option<IpProtocol> {
    match frame.first().map(|b| b >> 4)? {
        4 => Ipv4Packet::new_checked(frame).ok().map(|p| p.next_header()),
        6 => Ipv6Packet::new_checked(frame).ok().map(|p| p.next_header()),
        _ => None,
    }
}

/// Extract the 4-tuple of a TCP frame and whether it is an opening SYN.
fn sniff_tcp(frame: &[u8]) -> Option<(FlowKey, bool)> {
    match frame.first().map(|b| b >> 4)? {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let seg = TcpPacket::new_checked(ip.payload()).ok()?;
            let key = FlowKey {
                src: (std::net::IpAddr::V4(ip.src_addr()), seg.src_port()).into(),
                dst: (std::net::IpAddr::V4(ip.dst_addr()), seg.dst_port()).into(),
                proto: FlowProto::Tcp,
            };
            Some((key, seg.syn() && !seg.ack()))
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let seg = TcpPacket::new_checked(ip.payload()).ok()?;
            let key = FlowKey {
                src: (std::net::IpAddr::V6(ip.src_addr()), seg.src_port()).into(),
                dst: (std::net::IpAddr::V6(ip.dst_addr()), seg.dst_port()).into(),
                proto: FlowProto::Tcp,
            };
            Some((key, seg.syn() && !seg.ack()))
        }
        _ => None,
    }
}

async fn maybe_sleep(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{Ipv4Repr, TcpControl, TcpRepr, TcpSeqNumber};

    fn syn_frame(src: (Ipv4Address, u16), dst: (Ipv4Address, u16)) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let tcp = TcpRepr {
            src_port: src.1,
            dst_port: dst.1,
            control: TcpControl::Syn,
            seq_number: TcpSeqNumber(100),
            ack_number: None,
            window_len: 65535,
            window_scale: None,
            max_seg_size: Some(1460),
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload: &[],
        };
        let ip = Ipv4Repr {
            src_addr: src.0,
            dst_addr: dst.0,
            next_header: IpProtocol::Tcp,
            payload_len: tcp.buffer_len(),
            hop_limit: 64,
        };
        let mut frame = vec![0u8; ip.buffer_len() + tcp.buffer_len()];
        let mut ip_pkt = Ipv4Packet::new_unchecked(&mut frame);
        ip.emit(&mut ip_pkt, &caps);
        let mut tcp_pkt = TcpPacket::new_unchecked(ip_pkt.payload_mut());
        tcp.emit(
            &mut tcp_pkt,
            &IpAddress::Ipv4(src.0),
            &IpAddress::Ipv4(dst.0),
            &caps,
        );
        frame
    }

    #[test]
    fn sniffs_opening_syn() {
        let frame = syn_frame(
            (Ipv4Address::new(10, 0, 0, 2), 3333),
            (Ipv4Address::new(93, 184, 216, 34), 443),
        );
        let (key, syn) = sniff_tcp(&frame).unwrap();
        assert!(syn);
        assert_eq!(key.src.port(), 3333);
        assert_eq!(key.dst.port(), 443);
        assert_eq!(key.proto, FlowProto::Tcp);
        assert_eq!(classify(&frame), Some(IpProtocol::Tcp));
    }
}
