// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WebSocket transport.
//!
//! Performs the client upgrade over an already-established (possibly TLS)
//! connection and exposes the message stream as a plain byte stream:
//! writes become binary frames, binary frames become reads. Compression is
//! never negotiated.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};

/// Upgrade `stream` and wrap it as a byte stream.
///
/// `host` is forced into the `Host` header (SNI or server address); `path`
/// defaults to `/`; `headers` come from the transport config.
pub async fn upgrade<S>(
    stream: S,
    host: &str,
    path: Option<&str>,
    headers: &HashMap<String, String>,
) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match path {
        Some(p) if !p.is_empty() => p,
        _ => "/",
    };

    let mut request = format!("ws://{}{}", host, path)
        .into_client_request()
        .map_err(|e| Error::WebSocketUpgrade(e.to_string()))?;
    let header_map = request.headers_mut();
    header_map.insert(
        HOST,
        HeaderValue::from_str(host).map_err(|e| Error::WebSocketUpgrade(e.to_string()))?,
    );
    for (name, value) in headers {
        let name: tokio_tungstenite::tungstenite::http::header::HeaderName = name
            .parse()
            .map_err(|_| Error::WebSocketUpgrade(format!("bad header name {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::WebSocketUpgrade(e.to_string()))?;
        header_map.insert(name, value);
    }

    let (inner, _response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| Error::WebSocketUpgrade(e.to_string()))?;

    Ok(WsStream {
        inner,
        read_buf: Bytes::new(),
    })
}

/// Byte stream over binary WebSocket frames.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                // close frame or raw EOF both mean end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => this.read_buf = data,
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // text/ping/pong frames carry no tunnel payload
                    _ => continue,
                },
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
