// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ClientHello record fragmentation.
//!
//! Splits exactly the first outbound write that looks like a TLS handshake
//! record (leading `0x16`, longer than 50 bytes) into two TCP segments at
//! offset `5 + rand(0..9)`, sleeping `rand(0..4)` ms in between. Every
//! later write passes through untouched.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

const TLS_HANDSHAKE: u8 = 0x16;
const MIN_SPLIT_LEN: usize = 50;

enum State {
    /// waiting for the first handshake-looking write
    Watch,
    /// first half written, pausing before releasing the rest
    Pause(Pin<Box<Sleep>>),
    Passthrough,
}

pub struct FragmentStream<S> {
    inner: S,
    state: State,
    /// fixed split offset from config, otherwise `5 + rand(0..9)`
    split_at: Option<usize>,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, split_at: Option<usize>) -> FragmentStream<S> {
        FragmentStream {
            inner,
            state: State::Watch,
            split_at,
        }
    }
}

impl<S> AsyncWrite for FragmentStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Watch => {
                    if buf.first() != Some(&TLS_HANDSHAKE) || buf.len() <= MIN_SPLIT_LEN {
                        this.state = State::Passthrough;
                        continue;
                    }
                    let split = this
                        .split_at
                        .unwrap_or_else(|| 5 + rand::thread_rng().gen_range(0..9))
                        .clamp(1, buf.len() - 1);
                    match Pin::new(&mut this.inner).poll_write(cx, &buf[..split]) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(n)) => {
                            if n == split {
                                let delay = rand::thread_rng().gen_range(0..4);
                                this.state = State::Pause(Box::pin(tokio::time::sleep(
                                    Duration::from_millis(delay),
                                )));
                            } else {
                                // short write, give up on splitting
                                this.state = State::Passthrough;
                            }
                            // partial write; caller sends the tail again
                            return Poll::Ready(Ok(n));
                        }
                    }
                }
                State::Pause(sleep) => match sleep.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        this.state = State::Passthrough;
                    }
                },
                State::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, buf),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> AsyncRead for FragmentStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}
