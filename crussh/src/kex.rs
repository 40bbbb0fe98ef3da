// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use crate::{cipher, key, mac, msg};

use crate::session::Exchange;
use cryptovec::CryptoVec;
use crussh_keys::encoding::Encoding;
use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use std::cell::RefCell;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}
pub const DH_GROUP14_SHA256: Name = Name("diffie-hellman-group14-sha256");

// The 2048-bit MODP group of https://tools.ietf.org/html/rfc3526#section-3,
// generator 2.
const DH_GROUP14_PRIME: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

fn group14() -> Result<(BigNum, BigNum), crate::Error> {
    Ok((
        BigNum::from_hex_str(DH_GROUP14_PRIME)?,
        BigNum::from_u32(2)?,
    ))
}

/// Check that a peer's public value is in the open interval (1, p-1).
fn check_public(e: &BigNumRef, p: &BigNumRef) -> Result<(), crate::Error> {
    let one = BigNum::from_u32(1)?;
    let mut p1 = p.to_owned()?;
    p1.sub_word(1)?;
    if e <= one.as_ref() || e >= p1.as_ref() {
        return Err(crate::Error::Kex);
    }
    Ok(())
}

#[doc(hidden)]
pub struct Algorithm {
    local_secret: Option<BigNum>,
    shared_secret: Option<CryptoVec>,
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

thread_local! {
    static KEY_BUF: RefCell<CryptoVec> = RefCell::new(CryptoVec::new());
    static BUFFER: RefCell<CryptoVec> = RefCell::new(CryptoVec::new());
}

impl Algorithm {
    #[doc(hidden)]
    pub fn server_dh(
        _name: Name,
        exchange: &mut Exchange,
        payload: &[u8],
    ) -> Result<Algorithm, crate::Error> {
        debug!("server_dh");
        if payload.first() != Some(&msg::KEXDH_INIT) {
            return Err(crate::Error::Kex);
        }
        use crussh_keys::encoding::Reader;
        let mut r = payload.reader(1);
        let client_pubkey = BigNum::from_slice(r.read_mpint().map_err(crate::Error::from)?)?;

        let (p, g) = group14()?;
        check_public(&client_pubkey, &p)?;

        let mut ctx = BigNumContext::new()?;
        let mut server_secret = BigNum::new()?;
        p.rand_range(&mut server_secret)?;
        let mut server_pubkey = BigNum::new()?;
        server_pubkey.mod_exp(&g, &server_secret, &p, &mut ctx)?;
        let mut shared = BigNum::new()?;
        shared.mod_exp(&client_pubkey, &server_secret, &p, &mut ctx)?;

        // fill exchange.
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend(&server_pubkey.to_vec());
        let mut shared_secret = CryptoVec::new();
        shared_secret.extend(&shared.to_vec());
        Ok(Algorithm {
            local_secret: None,
            shared_secret: Some(shared_secret),
        })
    }

    #[doc(hidden)]
    pub fn client_dh(
        _name: Name,
        client_ephemeral: &mut CryptoVec,
        buf: &mut CryptoVec,
    ) -> Result<Algorithm, crate::Error> {
        let (p, g) = group14()?;
        let mut ctx = BigNumContext::new()?;
        let mut client_secret = BigNum::new()?;
        p.rand_range(&mut client_secret)?;
        let mut client_pubkey = BigNum::new()?;
        client_pubkey.mod_exp(&g, &client_secret, &p, &mut ctx)?;

        // fill exchange.
        let pubkey_bytes = client_pubkey.to_vec();
        client_ephemeral.clear();
        client_ephemeral.extend(&pubkey_bytes);

        buf.push(msg::KEXDH_INIT);
        buf.extend_ssh_mpint(&pubkey_bytes);

        Ok(Algorithm {
            local_secret: Some(client_secret),
            shared_secret: None,
        })
    }

    pub fn compute_shared_secret(&mut self, remote_pubkey_: &[u8]) -> Result<(), crate::Error> {
        let local_secret = std::mem::replace(&mut self.local_secret, None)
            .ok_or(crate::Error::Inconsistent)?;

        let (p, _) = group14()?;
        let remote_pubkey = BigNum::from_slice(remote_pubkey_)?;
        check_public(&remote_pubkey, &p)?;
        let mut ctx = BigNumContext::new()?;
        let mut shared = BigNum::new()?;
        shared.mod_exp(&remote_pubkey, &local_secret, &p, &mut ctx)?;
        let mut shared_secret = CryptoVec::new();
        shared_secret.extend(&shared.to_vec());
        self.shared_secret = Some(shared_secret);
        Ok(())
    }

    pub fn compute_exchange_hash<K: key::PubKey>(
        &self,
        key: &K,
        exchange: &Exchange,
        buffer: &mut CryptoVec,
    ) -> Result<crate::Sha256Hash, crate::Error> {
        // Computing the exchange hash, see page 22 of RFC 4253.
        buffer.clear();
        buffer.extend_ssh_string(&exchange.client_id);
        buffer.extend_ssh_string(&exchange.server_id);
        buffer.extend_ssh_string(&exchange.client_kex_init);
        buffer.extend_ssh_string(&exchange.server_kex_init);

        key.push_to(buffer);
        buffer.extend_ssh_mpint(&exchange.client_ephemeral);
        buffer.extend_ssh_mpint(&exchange.server_ephemeral);

        if let Some(ref shared) = self.shared_secret {
            buffer.extend_ssh_mpint(shared);
        }

        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&buffer);
        Ok(hasher.finalize())
    }

    pub fn compute_keys(
        &self,
        session_id: &crate::Sha256Hash,
        exchange_hash: &crate::Sha256Hash,
        cipher: cipher::Name,
        mac: Option<&'static str>,
        is_server: bool,
    ) -> Result<super::cipher::CipherPair, crate::Error> {
        let cipher = match cipher {
            super::cipher::aes256ctr::NAME => &super::cipher::aes256ctr::CIPHER,
            super::cipher::aes256gcm::NAME => &super::cipher::aes256gcm::CIPHER,
            _ => return Err(crate::Error::NoCommonCipher),
        };
        let mac = mac.unwrap_or(crate::mac::NONE);

        // https://tools.ietf.org/html/rfc4253#section-7.2
        BUFFER.with(|buffer| {
            KEY_BUF.with(|key| {
                let compute_key = |c, key: &mut CryptoVec, len| -> Result<(), crate::Error> {
                    let mut buffer = buffer.borrow_mut();
                    buffer.clear();
                    key.clear();

                    if let Some(ref shared) = self.shared_secret {
                        buffer.extend_ssh_mpint(shared);
                    }

                    buffer.extend(exchange_hash.as_ref());
                    buffer.push(c);
                    buffer.extend(session_id.as_ref());
                    let hash = {
                        use sha2::Digest;
                        let mut hasher = sha2::Sha256::new();
                        hasher.update(&buffer[..]);
                        hasher.finalize()
                    };
                    key.extend(hash.as_ref());

                    while key.len() < len {
                        // extend.
                        buffer.clear();
                        if let Some(ref shared) = self.shared_secret {
                            buffer.extend_ssh_mpint(shared);
                        }
                        buffer.extend(exchange_hash.as_ref());
                        buffer.extend(key);
                        let hash = {
                            use sha2::Digest;
                            let mut hasher = sha2::Sha256::new();
                            hasher.update(&buffer[..]);
                            hasher.finalize()
                        };
                        key.extend(&hash.as_ref());
                    }

                    key.resize(len);
                    Ok(())
                };

                // The derivation letters of RFC 4253 §7.2: 'A'/'B' are
                // the ivs, 'C'/'D' the encryption keys, 'E'/'F' the
                // mac keys, client-to-server letter first.
                let (local_to_remote_iv, remote_to_local_iv) =
                    if is_server { (b'B', b'A') } else { (b'A', b'B') };
                let (local_to_remote, remote_to_local) =
                    if is_server { (b'D', b'C') } else { (b'C', b'D') };
                let (local_to_remote_mac, remote_to_local_mac) =
                    if is_server { (b'F', b'E') } else { (b'E', b'F') };

                let mac_key_len = if cipher.needs_mac {
                    mac::key_len(mac)
                } else {
                    0
                };

                let mut key = key.borrow_mut();
                let mut iv = CryptoVec::new();
                let mut mac_key = CryptoVec::new();

                compute_key(local_to_remote, &mut key, cipher.key_len)?;
                compute_key(local_to_remote_iv, &mut iv, cipher.iv_len)?;
                compute_key(local_to_remote_mac, &mut mac_key, mac_key_len)?;
                let local_to_remote = (cipher.make_sealing_cipher)(
                    &key,
                    &iv,
                    mac::MacKey::new(mac, &mac_key),
                );

                compute_key(remote_to_local, &mut key, cipher.key_len)?;
                compute_key(remote_to_local_iv, &mut iv, cipher.iv_len)?;
                compute_key(remote_to_local_mac, &mut mac_key, mac_key_len)?;
                let remote_to_local = (cipher.make_opening_cipher)(
                    &key,
                    &iv,
                    mac::MacKey::new(mac, &mac_key),
                );

                Ok(super::cipher::CipherPair {
                    local_to_remote,
                    remote_to_local,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Exchange;
    use crussh_keys::encoding::Reader;

    #[test]
    fn shared_secret_agreement() {
        let mut client_exchange = Exchange::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GROUP14_SHA256, &mut client_exchange.client_ephemeral, &mut buf)
                .unwrap();

        // The client's message is a KEXDH_INIT carrying an mpint.
        assert_eq!(buf[0], msg::KEXDH_INIT);

        let mut server_exchange = Exchange::new();
        let mut r = buf.reader(1);
        server_exchange
            .client_ephemeral
            .extend(r.read_mpint().unwrap());
        let server =
            Algorithm::server_dh(DH_GROUP14_SHA256, &mut server_exchange, &buf).unwrap();

        client
            .compute_shared_secret(&server_exchange.server_ephemeral)
            .unwrap();
        assert_eq!(
            &client.shared_secret.as_ref().unwrap()[..],
            &server.shared_secret.as_ref().unwrap()[..]
        );
    }

    #[test]
    fn rejects_degenerate_public_values() {
        let mut exchange = Exchange::new();
        let mut payload = CryptoVec::new();
        payload.push(msg::KEXDH_INIT);
        payload.extend_ssh_mpint(&[1]);
        assert!(Algorithm::server_dh(DH_GROUP14_SHA256, &mut exchange, &payload).is_err());

        let mut payload = CryptoVec::new();
        payload.push(msg::KEXDH_INIT);
        payload.extend_ssh_mpint(&BigNum::from_hex_str(DH_GROUP14_PRIME).unwrap().to_vec());
        assert!(Algorithm::server_dh(DH_GROUP14_SHA256, &mut exchange, &payload).is_err());
    }

    #[test]
    fn derived_keys_differ_by_direction() {
        let mut shared = CryptoVec::new();
        shared.extend(&[0x17; 32]);
        let algo = Algorithm {
            local_secret: None,
            shared_secret: Some(shared),
        };
        let h = crate::Sha256Hash::default();
        // Both sides derive without error, and the session keys only
        // line up because the letters cross over.
        algo.compute_keys(&h, &h, cipher::aes256ctr::NAME, Some(mac::HMAC_SHA2_256), false)
            .unwrap();
        algo.compute_keys(&h, &h, cipher::aes256ctr::NAME, Some(mac::HMAC_SHA2_256), true)
            .unwrap();
    }
}
