// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

/// Errors produced by the core.
///
/// Per-flow errors are local: the flow that hit them is torn down and the
/// error is logged at info level, other flows are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("dns resolve: {0}")]
    DnsResolve(String),

    #[error("dial: {0}")]
    Dial(io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("websocket upgrade: {0}")]
    WebSocketUpgrade(String),

    #[error("protocol framing: {0}")]
    ProtocolFraming(String),

    #[error("handshake io: {0}")]
    HandshakeIo(io::Error),

    /// The UDP session found in the table belongs to a dead local flow.
    #[error("session stale")]
    SessionStale,

    /// Waiting on another task's dial+handshake exceeded the 5 s cap.
    #[error("session init timeout")]
    SessionInitTimeout,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    #[inline]
    pub fn config<T: ToString>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    #[inline]
    pub fn framing<T: ToString>(msg: T) -> Self {
        Error::ProtocolFraming(msg.to_string())
    }

    #[inline]
    pub fn tls<T: ToString>(msg: T) -> Self {
        Error::Tls(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
