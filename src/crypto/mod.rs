// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crypto primitives for the Mandala protocol family.
//!
//! Cross-implementation interop hinges on the exact constants here: the
//! PBKDF2 salt literal, 1000 iterations, 32-byte key, 12-byte IV and
//! 16-byte GCM tag with no associated data.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::RngCore;
use sha2::{Digest, Sha224, Sha256};

use crate::error::{Error, Result};

mod xorshift;

pub use xorshift::XorshiftCipher;

/// PBKDF2 salt shared with every Mandala peer.
pub const MANDALA_SALT: &[u8] = b"mandala-protocol-salt-v1";
/// PBKDF2 iteration count.
pub const MANDALA_ITERATIONS: u32 = 1000;
/// AES-256-GCM nonce size on the wire.
pub const IV_LEN: usize = 12;
/// AES-256-GCM tag size on the wire.
pub const TAG_LEN: usize = 16;

/// Process-wide password -> key memo. PBKDF2 is intentionally slow; flows
/// sharing one outbound must not pay it per connection. Lost insert races
/// recompute the same bytes.
static KEY_CACHE: Lazy<DashMap<String, [u8; 32]>> = Lazy::new(DashMap::new);

/// Derive the 32-byte Mandala AES key for `password`, memoized.
pub fn mandala_key(password: &str) -> [u8; 32] {
    if let Some(k) = KEY_CACHE.get(password) {
        return *k;
    }
    let mut key = [0u8; 32];
    pbkdf2_hmac_sha256(password.as_bytes(), MANDALA_SALT, MANDALA_ITERATIONS, &mut key);
    KEY_CACHE.insert(password.to_owned(), key);
    key
}

/// PBKDF2-HMAC-SHA256 (RFC 2898).
pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    type HmacSha256 = Hmac<Sha256>;

    let mut block_index: u32 = 1;
    for chunk in out.chunks_mut(32) {
        // U_1 = PRF(password, salt || INT(i))
        let mut mac =
            <HmacSha256 as KeyInit>::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(salt);
        mac.update(&block_index.to_be_bytes());
        let mut u: [u8; 32] = mac.finalize().into_bytes().into();
        let mut t = u;

        for _ in 1..iterations {
            let mut mac =
                <HmacSha256 as KeyInit>::new_from_slice(password).expect("hmac accepts any key length");
            mac.update(&u);
            u = mac.finalize().into_bytes().into();
            for (t, u) in t.iter_mut().zip(u.iter()) {
                *t ^= u;
            }
        }

        chunk.copy_from_slice(&t[..chunk.len()]);
        block_index += 1;
    }
}

/// Seal `plaintext` with AES-256-GCM under a fresh random IV.
///
/// Wire layout: `IV(12) ‖ ciphertext ‖ tag(16)`, no associated data.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    seal_with_iv(key, &iv, plaintext)
}

/// Seal with a caller-provided IV. Exists for deterministic tests; the wire
/// path always uses [`seal`].
pub fn seal_with_iv(key: &[u8; 32], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let ct = cipher
        .encrypt(Nonce::from_slice(iv), Payload::from(plaintext))
        .map_err(|_| Error::framing("aead seal failed"))?;

    let mut packet = Vec::with_capacity(IV_LEN + ct.len());
    packet.extend_from_slice(iv);
    packet.extend_from_slice(&ct);
    Ok(packet)
}

/// Open an `IV ‖ ciphertext ‖ tag` packet. Any bit flip fails.
pub fn open(key: &[u8; 32], packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < IV_LEN + TAG_LEN {
        return Err(Error::framing("aead packet too short"));
    }
    let (iv, ct) = packet.split_at(IV_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(iv), Payload::from(ct))
        .map_err(|_| Error::framing("aead open failed"))
}

/// Hex-encoded SHA-224 digest of the UTF-8 password, 56 lowercase chars.
pub fn trojan_password_hash(password: &str) -> [u8; 56] {
    let digest = Sha224::digest(password.as_bytes());
    let mut hex = [0u8; 56];
    for (i, b) in digest.iter().enumerate() {
        let (h0, h1) = u8_to_hex(*b);
        hex[2 * i] = h0;
        hex[2 * i + 1] = h1;
    }
    hex
}

/// Parse a UUID into its 16 raw bytes.
///
/// Dashes, braces and whitespace are stripped before hex decoding. Inputs
/// shorter than 32 hex chars are zero-padded at the tail; longer inputs and
/// non-hex characters are rejected.
pub fn parse_uuid(input: &str) -> Result<[u8; 16]> {
    let mut raw = [0u8; 16];
    let mut nibbles = 0usize;

    for c in input.bytes() {
        match c {
            b'-' | b'{' | b'}' => continue,
            c if c.is_ascii_whitespace() => continue,
            c => {
                if nibbles >= 32 {
                    return Err(Error::framing("uuid too long"));
                }
                let v = hex_val(c)?;
                raw[nibbles / 2] |= if nibbles % 2 == 0 { v << 4 } else { v };
                nibbles += 1;
            }
        }
    }

    if nibbles % 2 != 0 {
        return Err(Error::framing("uuid has odd hex length"));
    }
    Ok(raw)
}

#[inline]
fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 0x0a),
        b'A'..=b'F' => Ok(c - b'A' + 0x0a),
        _ => Err(Error::framing("invalid hex character")),
    }
}

#[inline]
pub(crate) fn u8_to_hex(n: u8) -> (u8, u8) {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    (TABLE[(n >> 4) as usize], TABLE[(n & 0x0f) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic_and_cached() {
        let a = mandala_key("secret");
        let b = mandala_key("secret");
        assert_eq!(a, b);

        let mut direct = [0u8; 32];
        pbkdf2_hmac_sha256(b"secret", MANDALA_SALT, MANDALA_ITERATIONS, &mut direct);
        assert_eq!(a, direct);

        assert_ne!(mandala_key("secret"), mandala_key("other"));
    }

    #[test]
    fn aead_round_trip() {
        let key = mandala_key("p");
        let packet = seal(&key, b"hello").unwrap();
        assert_eq!(packet.len(), IV_LEN + 5 + TAG_LEN);
        assert_eq!(open(&key, &packet).unwrap(), b"hello");
    }

    #[test]
    fn aead_rejects_any_bit_flip() {
        let key = mandala_key("p");
        let packet = seal(&key, b"payload").unwrap();
        for i in 0..packet.len() {
            let mut bad = packet.clone();
            bad[i] ^= 0x01;
            assert!(open(&key, &bad).is_err(), "flip at {} accepted", i);
        }
    }

    #[test]
    fn aead_seal_is_deterministic_under_fixed_iv() {
        let key = mandala_key("p");
        let iv = [0u8; IV_LEN];
        let a = seal_with_iv(&key, &iv, b"x").unwrap();
        let b = seal_with_iv(&key, &iv, b"x").unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..IV_LEN], &iv);
    }

    #[test]
    fn uuid_canonical_round_trip() {
        let raw = parse_uuid("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(raw, [0x11; 16]);

        let raw = parse_uuid("01234567-89ab-cdef-0123-456789abcdef").unwrap();
        let mut hex = String::new();
        for b in raw {
            let (h0, h1) = u8_to_hex(b);
            hex.push(h0 as char);
            hex.push(h1 as char);
        }
        assert_eq!(hex, "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn uuid_braces_and_short_inputs() {
        assert_eq!(
            parse_uuid("{11111111-1111-1111-1111-111111111111}").unwrap(),
            [0x11; 16]
        );
        // short input is zero padded at the tail
        let raw = parse_uuid("ff").unwrap();
        let mut expect = [0u8; 16];
        expect[0] = 0xff;
        assert_eq!(raw, expect);

        assert!(parse_uuid("zz").is_err());
        assert!(parse_uuid("0123456789abcdef0123456789abcdef00").is_err());
    }

    #[test]
    fn trojan_hash_shape() {
        let hex = trojan_password_hash("test");
        assert_eq!(hex.len(), 56);
        assert!(hex.iter().all(|c| c.is_ascii_hexdigit()));
        let expect = Sha224::digest(b"test");
        let decoded: Vec<u8> = hex
            .chunks(2)
            .map(|p| u8::from_str_radix(std::str::from_utf8(p).unwrap(), 16).unwrap())
            .collect();
        assert_eq!(&decoded[..], &expect[..]);
    }
}
