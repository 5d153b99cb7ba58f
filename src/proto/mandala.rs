// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mandala request framing.
//!
//! # Current generation (AEAD)
//!
//! | IV | AES-256-GCM(key, IV, `0x01 ‖ Target`) |
//! | -- | ------------------------------------- |
//! | 12 | ciphertext ‖ tag(16)                  |
//!
//! The key is PBKDF2-derived from the password (see [`crate::crypto`]).
//! There is no CRLF trailer and no padding; the GCM tag authenticates the
//! packet.
//!
//! # Legacy generation
//!
//! `salt(4) ‖ keystream(password, salt) ⊕ (0x01 ‖ Target)`, with the rest
//! of the stream XORed by per-direction keystreams seeded from the same
//! salt. Only servers running the pre-AEAD revision expect this.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{self, XorshiftCipher};
use crate::error::Result;
use crate::proto::Target;

const CMD_CONNECT: u8 = 0x01;

fn connect_plaintext(target: &Target) -> Vec<u8> {
    let mut plain = Vec::with_capacity(1 + target.encoded_len());
    plain.push(CMD_CONNECT);
    target.extend_socks5(&mut plain);
    plain
}

/// Build the sealed CONNECT packet for `target`.
pub fn build_request(key: &[u8; 32], target: &Target) -> Result<Vec<u8>> {
    crypto::seal(key, &connect_plaintext(target))
}

/// Build the legacy CONNECT packet: fresh 4-byte salt plus the
/// keystream-XORed plaintext. Returns the packet, the salt and the write
/// cipher advanced past the handshake body, ready for [`LegacyStream`].
pub fn build_legacy_request(
    password: &str,
    target: &Target,
) -> (Vec<u8>, [u8; 4], XorshiftCipher) {
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut cipher = XorshiftCipher::new(password.as_bytes(), &salt);
    let mut body = connect_plaintext(target);
    cipher.apply(&mut body);

    let mut packet = Vec::with_capacity(4 + body.len());
    packet.extend(salt);
    packet.extend(body);
    (packet, salt, cipher)
}

/// Legacy stream obfuscation.
///
/// Each direction runs an independent keystream seeded from the handshake
/// salt; the write keystream continues from the handshake packet body.
pub struct LegacyStream<S> {
    inner: S,
    read_key: XorshiftCipher,
    write_key: XorshiftCipher,
    /// ciphertext for an in-flight write, drained before the next one
    pending: Vec<u8>,
    written: usize,
}

impl<S> LegacyStream<S> {
    /// `write_key` must be the cipher state left over from encrypting the
    /// handshake body.
    pub fn new(inner: S, password: &str, salt: &[u8; 4], write_key: XorshiftCipher) -> Self {
        LegacyStream {
            inner,
            read_key: XorshiftCipher::new(password.as_bytes(), salt),
            write_key,
            pending: Vec::new(),
            written: 0,
        }
    }
}

impl<S> AsyncRead for LegacyStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_key.apply(&mut buf.filled_mut()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for LegacyStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // the keystream advances exactly once per logical chunk, so the
        // ciphertext is staged and drained even across Pending returns
        if this.pending.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.pending.extend_from_slice(buf);
            this.write_key.apply(&mut this.pending);
            this.written = 0;
        }

        while this.written < this.pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending[this.written..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => this.written += n,
            }
        }

        let len = this.pending.len();
        this.pending.clear();
        this.written = 0;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
