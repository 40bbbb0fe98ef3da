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

//! The binary key-file container: a magic code, a comment, and a key
//! blob, optionally encrypted with a passphrase-derived 3DES-CBC key.

use crate::encoding::{Encoding, Reader};
use crate::key::KeyPair;
use crate::Error;
use cryptovec::CryptoVec;
use openssl::symm::{decrypt, encrypt, Cipher};

/// Magic code of a public key file.
pub const KEY_MAGIC_PUBLIC: u32 = 0x73736801;
/// Magic code of a plaintext private key file.
pub const KEY_MAGIC_PRIVATE: u32 = 0x73736802;
/// Magic code of a passphrase-encrypted private key file.
pub const KEY_MAGIC_PRIVATE_ENCRYPTED: u32 = 0x73736803;

/// The cipher used for passphrase encryption of private key files.
pub const PASSPHRASE_CIPHER: &str = "3des-cbc";

const DES3_KEY_LEN: usize = 24;
const DES3_IV_LEN: usize = 8;

/// Frame a key file: magic, total length, comment, body.
pub fn write_key_blob(magic: u32, comment: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(&magic.to_be_bytes());
    out.extend(&[0, 0, 0, 0]); // total length, patched below
    out.extend_ssh_string(comment.as_bytes());
    out.extend(body);
    let total = out.len() as u32;
    out[4..8].copy_from_slice(&total.to_be_bytes());
    out
}

/// Split a key file into its magic code, comment and body. The body is
/// returned in a `CryptoVec` since it may hold private key material.
pub fn read_key_blob(data: &[u8]) -> Result<(u32, String, CryptoVec), Error> {
    let mut r = data.reader(0);
    let magic = r.read_u32()?;
    if magic != KEY_MAGIC_PUBLIC
        && magic != KEY_MAGIC_PRIVATE
        && magic != KEY_MAGIC_PRIVATE_ENCRYPTED
    {
        return Err(Error::CouldNotReadKey);
    }
    let total = r.read_u32()? as usize;
    if total != data.len() {
        return Err(Error::CouldNotReadKey);
    }
    let comment = std::str::from_utf8(r.read_string()?)
        .map_err(|_| Error::CouldNotReadKey)?
        .to_string();
    let mut body = CryptoVec::new();
    body.extend(&data[r.position..]);
    Ok((magic, comment, body))
}

/// Derive the 3DES key from a passphrase.
fn passphrase_key(passphrase: &str) -> CryptoVec {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    let digest = hasher.finalize();
    let mut key = CryptoVec::new();
    key.extend(&digest[..DES3_KEY_LEN]);
    key
}

/// Encode a private key into the key-file container, encrypting it when
/// a passphrase is supplied.
pub fn encode_secret_key(
    key: &KeyPair,
    passphrase: Option<&str>,
    comment: &str,
) -> Result<Vec<u8>, Error> {
    let blob = key.private_blob()?;
    let mut body = Vec::new();
    let magic = if let Some(passphrase) = passphrase {
        let k = passphrase_key(passphrase);
        let iv = [0; DES3_IV_LEN];
        let encrypted = encrypt(Cipher::des_ede3_cbc(), &k, Some(&iv), &blob)?;
        body.extend_ssh_string(PASSPHRASE_CIPHER.as_bytes());
        body.extend_ssh_string(&encrypted);
        KEY_MAGIC_PRIVATE_ENCRYPTED
    } else {
        body.extend_ssh_string(b"none");
        body.extend_ssh_string(&blob);
        KEY_MAGIC_PRIVATE
    };
    Ok(write_key_blob(magic, comment, &body))
}

/// Decode a private key file, deciphering it with the supplied
/// passphrase if necessary. Returns the key and the comment.
pub fn decode_secret_key(
    data: &[u8],
    passphrase: Option<&str>,
) -> Result<(KeyPair, String), Error> {
    let (magic, comment, body) = read_key_blob(data)?;
    let mut r = body.reader(0);
    match magic {
        KEY_MAGIC_PRIVATE => {
            if r.read_string()? != b"none" {
                return Err(Error::CouldNotReadKey);
            }
            let blob = r.read_string()?;
            Ok((KeyPair::parse_private_blob(blob)?, comment))
        }
        KEY_MAGIC_PRIVATE_ENCRYPTED => {
            let cipher = r.read_string()?;
            if cipher != PASSPHRASE_CIPHER.as_bytes() {
                return Err(Error::UnsupportedKeyType(cipher.to_vec()));
            }
            let encrypted = r.read_string()?;
            let passphrase = passphrase.ok_or(Error::KeyIsEncrypted)?;
            let k = passphrase_key(passphrase);
            let iv = [0; DES3_IV_LEN];
            let blob = decrypt(Cipher::des_ede3_cbc(), &k, Some(&iv), encrypted)
                .map_err(|_| Error::KeyIsEncrypted)?;
            let key = KeyPair::parse_private_blob(&blob)?;
            Ok((key, comment))
        }
        _ => Err(Error::CouldNotReadKey),
    }
}

/// Encode a public key blob into the key-file container.
pub fn encode_public_key(blob: &[u8], comment: &str) -> Vec<u8> {
    write_key_blob(KEY_MAGIC_PUBLIC, comment, blob)
}

/// Decode a public key file into its blob and comment.
pub fn decode_public_key(data: &[u8]) -> Result<(Vec<u8>, String), Error> {
    let (magic, comment, body) = read_key_blob(data)?;
    if magic != KEY_MAGIC_PUBLIC {
        return Err(Error::CouldNotReadKey);
    }
    Ok((body.to_vec(), comment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::parse_public_key;

    #[test]
    fn public_container_roundtrip() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let blob = key.public_blob().unwrap();
        let file = encode_public_key(&blob, "user@host");
        let (blob2, comment) = decode_public_key(&file).unwrap();
        assert_eq!(blob, blob2);
        assert_eq!(comment, "user@host");
        assert!(parse_public_key(&blob2).is_ok());
    }

    #[test]
    fn secret_container_plain() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let file = encode_secret_key(&key, None, "plain key").unwrap();
        let (restored, comment) = decode_secret_key(&file, None).unwrap();
        assert_eq!(comment, "plain key");
        assert_eq!(
            restored.public_blob().unwrap(),
            key.public_blob().unwrap()
        );
    }

    #[test]
    fn secret_container_encrypted() {
        let key = KeyPair::generate_rsa(2048).unwrap();
        let file = encode_secret_key(&key, Some("blabla"), "locked").unwrap();
        // Missing passphrase.
        match decode_secret_key(&file, None) {
            Err(Error::KeyIsEncrypted) => {}
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
        // Wrong passphrase.
        assert!(decode_secret_key(&file, Some("blybly")).is_err());
        // Right passphrase.
        let (restored, _) = decode_secret_key(&file, Some("blabla")).unwrap();
        assert_eq!(
            restored.public_blob().unwrap(),
            key.public_blob().unwrap()
        );
    }

    #[test]
    fn truncated_container_is_rejected() {
        let key = KeyPair::generate_dss(1024).unwrap();
        let file = encode_secret_key(&key, None, "c").unwrap();
        assert!(decode_secret_key(&file[..file.len() - 1], None).is_err());
    }
}
