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
use crate::compression::*;
use crate::{cipher, compression, kex, mac, msg, Error};
use cryptovec::CryptoVec;
use crussh_keys::encoding::{Encoding, Reader};
use crussh_keys::key;
use crussh_keys::key::{KeyPair, PublicKey};
use rand::RngCore;
use std::str::from_utf8;

#[derive(Debug)]
pub struct Names {
    pub kex: kex::Name,
    pub key: key::Name,
    pub cipher: cipher::Name,
    pub mac: Option<&'static str>,
    pub server_compression: Compression,
    pub client_compression: Compression,
    pub ignore_guessed: bool,
}

/// Lists of preferred algorithms. This is normally hard-coded into implementations.
#[derive(Debug)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: &'static [kex::Name],
    /// Preferred host key algorithms.
    pub key: &'static [key::Name],
    /// Preferred symmetric ciphers.
    pub cipher: &'static [cipher::Name],
    /// Preferred MAC algorithms.
    pub mac: &'static [&'static str],
    /// Preferred compression algorithms.
    pub compression: &'static [&'static str],
}

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: &[kex::DH_GROUP14_SHA256],
        key: &[key::DSS, key::SSH_RSA],
        cipher: &[cipher::aes256ctr::NAME, cipher::aes256gcm::NAME],
        mac: &[mac::HMAC_SHA2_256, mac::HMAC_SHA1, mac::NONE],
        compression: &[compression::NONE, compression::ZLIB],
    };

    pub const COMPRESSED: Preferred = Preferred {
        kex: &[kex::DH_GROUP14_SHA256],
        key: &[key::DSS, key::SSH_RSA],
        cipher: &[cipher::aes256ctr::NAME, cipher::aes256gcm::NAME],
        mac: &[mac::HMAC_SHA2_256, mac::HMAC_SHA1, mac::NONE],
        compression: &[compression::ZLIB, compression::NONE],
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// Named algorithms.
pub trait Named {
    /// The name of this algorithm.
    fn name(&self) -> &'static str;
}

impl Named for () {
    fn name(&self) -> &'static str {
        ""
    }
}

impl Named for PublicKey {
    fn name(&self) -> &'static str {
        PublicKey::name(self)
    }
}

impl Named for KeyPair {
    fn name(&self) -> &'static str {
        KeyPair::name(self)
    }
}

pub trait Select {
    fn select<S: AsRef<str> + Copy>(a: &[S], b: &[u8]) -> Option<(bool, S)>;

    fn read_kex(buffer: &[u8], pref: &Preferred) -> Result<Names, Error> {
        let mut r = buffer.reader(17);
        let kex_string = r.read_string()?;
        let (kex_both_first, kex_algorithm) = if let Some(x) = Self::select(pref.kex, kex_string) {
            x
        } else {
            debug!(
                "Could not find common kex algorithm, other side only supports {:?}, we only support {:?}",
                from_utf8(kex_string),
                pref.kex
            );
            return Err(Error::NoCommonKexAlgo);
        };

        let key_string = r.read_string()?;
        let (key_both_first, key_algorithm) = if let Some(x) = Self::select(pref.key, key_string) {
            x
        } else {
            debug!(
                "Could not find common host key algorithm, other side only supports {:?}, we only support {:?}",
                from_utf8(key_string),
                pref.key
            );
            return Err(Error::NoCommonKeyAlgo);
        };

        let cipher_string = r.read_string()?;
        let cipher = Self::select(pref.cipher, cipher_string);
        if cipher.is_none() {
            debug!(
                "Could not find common cipher, other side only supports {:?}, we only support {:?}",
                from_utf8(cipher_string),
                pref.cipher
            );
            return Err(Error::NoCommonCipher);
        }
        r.read_string()?; // cipher server-to-client.

        let mac = Self::select(pref.mac, r.read_string()?);
        let mac = mac.map(|(_, x)| x);
        r.read_string()?; // mac server-to-client.

        // client-to-server compression.
        let client_compression =
            if let Some((_, c)) = Self::select(pref.compression, r.read_string()?) {
                Compression::from_string(c)
            } else {
                return Err(Error::NoCommonCompression);
            };
        // server-to-client compression.
        let server_compression =
            if let Some((_, c)) = Self::select(pref.compression, r.read_string()?) {
                Compression::from_string(c)
            } else {
                return Err(Error::NoCommonCompression);
            };
        r.read_string()?; // languages client-to-server
        r.read_string()?; // languages server-to-client

        let follows = r.read_byte()? != 0;
        match (cipher, mac, follows) {
            (Some((_, cipher)), mac, fol) => {
                // A cipher without an authenticator of its own needs a
                // real MAC.
                if cipher::needs_mac(cipher) && mac.map_or(true, |m| m == mac::NONE) {
                    return Err(Error::NoCommonMac);
                }
                Ok(Names {
                    kex: kex_algorithm,
                    key: key_algorithm,
                    cipher,
                    mac,
                    client_compression,
                    server_compression,
                    // Ignore the next packet if (1) it follows and (2) it's not the correct guess.
                    ignore_guessed: fol && !(kex_both_first && key_both_first),
                })
            }
            _ => Err(Error::KexInit),
        }
    }
}

pub struct Server;
pub struct Client;

impl Select for Server {
    fn select<S: AsRef<str> + Copy>(server_list: &[S], client_list: &[u8]) -> Option<(bool, S)> {
        let mut both_first_choice = true;
        for c in client_list.split(|&x| x == b',') {
            for &s in server_list {
                if c == s.as_ref().as_bytes() {
                    return Some((both_first_choice, s));
                }
                both_first_choice = false
            }
        }
        None
    }
}

impl Select for Client {
    fn select<S: AsRef<str> + Copy>(client_list: &[S], server_list: &[u8]) -> Option<(bool, S)> {
        let mut both_first_choice = true;
        for &c in client_list {
            for s in server_list.split(|&x| x == b',') {
                if s == c.as_ref().as_bytes() {
                    return Some((both_first_choice, c));
                }
                both_first_choice = false
            }
        }
        None
    }
}

pub fn write_kex(prefs: &Preferred, buf: &mut CryptoVec) -> Result<(), Error> {
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);

    buf.extend(&cookie); // cookie
    buf.extend_list(prefs.kex.iter()); // kex algo

    buf.extend_list(prefs.key.iter()); // host key algo

    buf.extend_list(prefs.cipher.iter()); // cipher client to server
    buf.extend_list(prefs.cipher.iter()); // cipher server to client

    buf.extend_list(prefs.mac.iter()); // mac client to server
    buf.extend_list(prefs.mac.iter()); // mac server to client

    buf.extend_list(prefs.compression.iter()); // compress client to server
    buf.extend_list(prefs.compression.iter()); // compress server to client

    buf.write_empty_list(); // languages client to server
    buf.write_empty_list(); // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_kexinit_negotiates_with_itself() {
        let mut buf = CryptoVec::new();
        write_kex(&Preferred::DEFAULT, &mut buf).unwrap();
        assert_eq!(buf[0], msg::KEXINIT);
        let names = Server::read_kex(&buf, &Preferred::DEFAULT).unwrap();
        assert_eq!(names.kex, kex::DH_GROUP14_SHA256);
        assert_eq!(names.key, key::DSS);
        assert_eq!(names.cipher, cipher::aes256ctr::NAME);
        assert_eq!(names.mac, Some(mac::HMAC_SHA2_256));
        assert!(!names.ignore_guessed);
    }

    #[test]
    fn client_preference_wins() {
        // The server would pick its own first choice; the chosen
        // algorithm must be the first of the client's list also present
        // on the server's.
        let client_list = b"ssh-rsa,ssh-dss";
        let (_, chosen) = Server::select(&[key::DSS, key::SSH_RSA], client_list).unwrap();
        assert_eq!(chosen, key::SSH_RSA);
    }

    #[test]
    fn ctr_without_mac_is_refused() {
        // Build a KEXINIT whose MAC lists only carry "none".
        let only_none = Preferred {
            kex: &[kex::DH_GROUP14_SHA256],
            key: &[key::DSS],
            cipher: &[cipher::aes256ctr::NAME],
            mac: &[mac::NONE],
            compression: &[compression::NONE],
        };
        let mut buf = CryptoVec::new();
        write_kex(&only_none, &mut buf).unwrap();
        match Server::read_kex(&buf, &only_none) {
            Err(Error::NoCommonMac) => {}
            r => panic!("unexpected result {:?}", r),
        }
    }
}
