//! Message authentication for the classic (non-AEAD) transport
//! ciphers. The MAC is computed over the packet sequence number
//! followed by the plaintext packet, and verified before the packet is
//! handed to dispatch; a mismatch is fatal to the session.

use cryptovec::CryptoVec;
use hmac::{Hmac, Mac as _, NewMac};
use sha1::Sha1;
use sha2::Sha256;

pub const HMAC_SHA2_256: &str = "hmac-sha2-256";
pub const HMAC_SHA1: &str = "hmac-sha1";
pub const NONE: &str = "none";

/// Key length of the given MAC algorithm.
pub fn key_len(name: &str) -> usize {
    match name {
        HMAC_SHA2_256 => 32,
        HMAC_SHA1 => 20,
        _ => 0,
    }
}

/// Tag length of the given MAC algorithm.
pub fn mac_len(name: &str) -> usize {
    match name {
        HMAC_SHA2_256 => 32,
        HMAC_SHA1 => 20,
        _ => 0,
    }
}

/// A keyed MAC instance for one direction of the transport.
pub enum MacKey {
    None,
    HmacSha256(CryptoVec),
    HmacSha1(CryptoVec),
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            MacKey::None => write!(f, "MacKey::None"),
            MacKey::HmacSha256(_) => write!(f, "MacKey::HmacSha256 {{ (hidden) }}"),
            MacKey::HmacSha1(_) => write!(f, "MacKey::HmacSha1 {{ (hidden) }}"),
        }
    }
}

impl MacKey {
    /// Build a keyed instance from a negotiated name and derived key
    /// material.
    pub fn new(name: &str, key: &[u8]) -> MacKey {
        match name {
            HMAC_SHA2_256 => {
                let mut k = CryptoVec::new();
                k.extend(key);
                MacKey::HmacSha256(k)
            }
            HMAC_SHA1 => {
                let mut k = CryptoVec::new();
                k.extend(key);
                MacKey::HmacSha1(k)
            }
            _ => MacKey::None,
        }
    }

    pub fn mac_len(&self) -> usize {
        match *self {
            MacKey::None => 0,
            MacKey::HmacSha256(_) => 32,
            MacKey::HmacSha1(_) => 20,
        }
    }

    /// Compute the tag over `seqn || packet` into `tag`.
    pub fn compute(&self, seqn: u32, packet: &[u8], tag: &mut [u8]) {
        match *self {
            MacKey::None => {}
            MacKey::HmacSha256(ref key) => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("hmac keys take any length");
                mac.update(&seqn.to_be_bytes());
                mac.update(packet);
                tag.copy_from_slice(&mac.finalize().into_bytes());
            }
            MacKey::HmacSha1(ref key) => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .expect("hmac keys take any length");
                mac.update(&seqn.to_be_bytes());
                mac.update(packet);
                tag.copy_from_slice(&mac.finalize().into_bytes());
            }
        }
    }

    /// Verify a received tag, in constant time.
    pub fn verify(&self, seqn: u32, packet: &[u8], tag: &[u8]) -> bool {
        match *self {
            MacKey::None => tag.is_empty(),
            MacKey::HmacSha256(ref key) => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("hmac keys take any length");
                mac.update(&seqn.to_be_bytes());
                mac.update(packet);
                mac.verify(tag).is_ok()
            }
            MacKey::HmacSha1(ref key) => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .expect("hmac keys take any length");
                mac.update(&seqn.to_be_bytes());
                mac.update(packet);
                mac.verify(tag).is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from RFC 2202 and RFC 4231, case 1, adapted to the
    // seqn prefix by splitting the input.
    #[test]
    fn hmac_sha1_rfc2202() {
        let key = [0x0b; 20];
        let mac = MacKey::new(HMAC_SHA1, &key);
        let mut tag = [0; 20];
        // "Hi There" = 48 69 20 54 68 65 72 65; feed the first four
        // bytes as the "sequence number".
        mac.compute(0x48692054, b"here", &mut tag);
        assert_eq!(
            &tag[..],
            &[
                0xb6, 0x17, 0x31, 0x86, 0x55, 0x05, 0x72, 0x64, 0xe2, 0x8b, 0xc0, 0xb6,
                0xfb, 0x37, 0x8c, 0x8e, 0xf1, 0x46, 0xbe, 0x00
            ][..]
        );
        // Case differs: 'h' vs 'H'.
        assert!(!mac.verify(0x48692054, b"Here", &tag));
        assert!(mac.verify(0x48692054, b"here", &tag));
    }

    #[test]
    fn compute_verify_roundtrip() {
        let mac = MacKey::new(HMAC_SHA2_256, &[7; 32]);
        let mut tag = [0; 32];
        mac.compute(42, b"a packet", &mut tag);
        assert!(mac.verify(42, b"a packet", &tag));
        // The sequence number is part of the authenticated data.
        assert!(!mac.verify(43, b"a packet", &tag));
        assert!(!mac.verify(42, b"another packet", &tag));
    }

    #[test]
    fn none_accepts_only_empty_tags() {
        let mac = MacKey::new(NONE, &[]);
        assert_eq!(mac.mac_len(), 0);
        assert!(mac.verify(0, b"x", &[]));
        assert!(!mac.verify(0, b"x", &[0]));
    }
}
