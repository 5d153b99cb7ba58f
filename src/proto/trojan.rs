// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trojan request framing.
//!
//! # Protocol
//!
//! | Password hex |   CRLF    | CMD | [`Target`] |   CRLF    |
//! | ------------ | --------- | --- | ---------- | --------- |
//! |      56      | `b"\r\n"` |  1  |  Variable  | `b"\r\n"` |
//!
//! The password is the hex SHA-224 digest; CMD is `0x01` (CONNECT). The
//! server expects payload bytes to follow immediately.

use crate::crypto::trojan_password_hash;
use crate::proto::{Target, CRLF};

const CMD_CONNECT: u8 = 0x01;

/// Build the Trojan CONNECT request for `target`.
pub fn build_request(password: &str, target: &Target) -> Vec<u8> {
    let hash = trojan_password_hash(password);

    let mut buf = Vec::with_capacity(56 + 2 + 1 + target.encoded_len() + 2);
    buf.extend(hash);
    buf.extend(CRLF);
    buf.push(CMD_CONNECT);
    target.extend_socks5(&mut buf);
    buf.extend(CRLF);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha224};

    #[test]
    fn ipv4_request_layout() {
        // password="test", target=1.2.3.4:443
        let target = Target::new("1.2.3.4", 443).unwrap();
        let req = build_request("test", &target);

        assert_eq!(req.len(), 56 + 2 + 1 + 7 + 2);
        assert_eq!(req.len(), 68);

        let expect_hash = Sha224::digest(b"test");
        let got: Vec<u8> = req[..56]
            .chunks(2)
            .map(|p| u8::from_str_radix(std::str::from_utf8(p).unwrap(), 16).unwrap())
            .collect();
        assert_eq!(&got[..], &expect_hash[..]);

        assert_eq!(&req[56..58], b"\r\n");
        assert_eq!(req[58], 0x01);
        assert_eq!(&req[59..66], &[0x01, 1, 2, 3, 4, 0x01, 0xbb]);
        assert_eq!(&req[66..68], b"\r\n");
    }

    #[test]
    fn domain_request_length() {
        let target = Target::new("example.com", 443).unwrap();
        let req = build_request("pw", &target);
        assert_eq!(req.len(), 56 + 2 + 1 + (1 + 1 + 11 + 2) + 2);
    }
}
