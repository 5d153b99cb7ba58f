// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shadowsocks request framing.
//!
//! The request is the bare SOCKS5-style target address; cipher framing is
//! provided by the outer TLS/WebSocket transport rather than by this
//! layer. Servers expecting native AEAD framing (SIP004/SIP022) are not
//! supported by this outbound.

use crate::proto::Target;

/// Build the Shadowsocks header for `target`.
pub fn build_request(target: &Target) -> Vec<u8> {
    target.to_socks5_bytes()
}
