// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual TCP streams.
//!
//! A flow accepted by the user-space stack is exposed to the relay as an
//! ordinary `AsyncRead + AsyncWrite`. Bytes cross between the stack task
//! and the flow task over bounded channels; the stack task is woken
//! through a shared [`Notify`] whenever the flow makes progress it cannot
//! observe on its own (writes, shutdown, drop).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::PollSender;

use crate::nat::FlowKey;

/// Per-direction channel depth, in chunks.
pub(super) const CHANNEL_DEPTH: usize = 32;
/// Largest chunk a single flow write produces.
const WRITE_CHUNK: usize = 16 * 1024;

/// An accepted TCP flow, handed from the stack to the flow handler.
pub struct TcpFlow {
    pub key: FlowKey,
    pub stream: TunTcpStream,
}

pub struct TunTcpStream {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    tx: PollSender<Bytes>,
    notify: Arc<Notify>,
}

impl TunTcpStream {
    pub(super) fn new(
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        notify: Arc<Notify>,
    ) -> TunTcpStream {
        TunTcpStream {
            rx,
            leftover: Bytes::new(),
            tx: PollSender::new(tx),
            notify,
        }
    }
}

impl AsyncRead for TunTcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.leftover.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // sender dropped: guest sent FIN, clean EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(chunk)) => this.leftover = chunk,
            }
        }

        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        // freed channel capacity lets the stack pull more from the socket
        this.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.tx.poll_reserve(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            Poll::Ready(Ok(())) => {}
        }

        let n = buf.len().min(WRITE_CHUNK);
        if this
            .tx
            .send_item(Bytes::copy_from_slice(&buf[..n]))
            .is_err()
        {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        this.notify.notify_one();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // half-close: the stack sends FIN once queued bytes drain
        this.tx.close();
        this.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunTcpStream {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
        self.notify.notify_one();
    }
}

/// Stack-side state of one TCP flow.
pub(super) struct FlowEntry {
    pub key: FlowKey,
    /// guest -> flow; `None` once EOF has been delivered
    pub to_flow: Option<mpsc::Sender<Bytes>>,
    /// flow -> guest
    pub from_flow: mpsc::Receiver<Bytes>,
    /// chunk partially written into the socket buffer
    pub pending: Option<Bytes>,
    /// flow handed to the accept queue
    pub established: bool,
    /// staged stream until the handshake completes
    pub staged: Option<TcpFlow>,
    /// the flow's read half is gone
    pub reader_gone: bool,
    /// the flow's write half is gone
    pub writer_gone: bool,
    /// FIN issued towards the guest
    pub fin_sent: bool,
}

impl FlowEntry {
    pub fn new(key: FlowKey, notify: Arc<Notify>) -> FlowEntry {
        let (to_flow_tx, to_flow_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (from_flow_tx, from_flow_rx) = mpsc::channel(CHANNEL_DEPTH);

        let stream = TunTcpStream::new(to_flow_rx, from_flow_tx, notify);
        FlowEntry {
            key,
            to_flow: Some(to_flow_tx),
            from_flow: from_flow_rx,
            pending: None,
            established: false,
            staged: Some(TcpFlow { key, stream }),
            reader_gone: false,
            writer_gone: false,
            fin_sent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::nat::FlowProto;

    fn key() -> FlowKey {
        FlowKey {
            src: "10.0.0.2:4000".parse::<SocketAddr>().unwrap(),
            dst: "1.1.1.1:80".parse::<SocketAddr>().unwrap(),
            proto: FlowProto::Tcp,
        }
    }

    #[tokio::test]
    async fn read_delivers_chunks_then_eof() {
        let notify = Arc::new(Notify::new());
        let mut entry = FlowEntry::new(key(), notify);
        let mut stream = entry.staged.take().unwrap().stream;

        let tx = entry.to_flow.clone().unwrap();
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        entry.to_flow = None;
        drop(tx);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn write_lands_in_stack_channel() {
        let notify = Arc::new(Notify::new());
        let mut entry = FlowEntry::new(key(), notify);
        let mut stream = entry.staged.take().unwrap().stream;

        stream.write_all(b"abc").await.unwrap();
        let chunk = entry.from_flow.recv().await.unwrap();
        assert_eq!(&chunk[..], b"abc");

        stream.shutdown().await.unwrap();
        assert!(entry.from_flow.recv().await.is_none());
    }
}
