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
use crate::mac::MacKey;
use crate::sshbuffer::SSHBuffer;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod aes256ctr;
pub mod aes256gcm;
pub mod clear;

pub struct Cipher {
    pub name: Name,
    pub key_len: usize,
    pub iv_len: usize,
    /// Whether this cipher authenticates through a separately
    /// negotiated MAC (as opposed to an AEAD tag of its own).
    pub needs_mac: bool,
    pub make_opening_cipher: fn(key: &[u8], iv: &[u8], mac: MacKey) -> OpeningCipher,
    pub make_sealing_cipher: fn(key: &[u8], iv: &[u8], mac: MacKey) -> SealingCipher,
}

pub enum OpeningCipher {
    Clear(clear::Key),
    Aes256Ctr(aes256ctr::OpeningKey),
    Aes256Gcm(aes256gcm::OpeningKey),
}

impl OpeningCipher {
    fn as_opening_key(&self) -> &dyn OpeningKey {
        match *self {
            OpeningCipher::Clear(ref key) => key,
            OpeningCipher::Aes256Ctr(ref key) => key,
            OpeningCipher::Aes256Gcm(ref key) => key,
        }
    }
}

pub enum SealingCipher {
    Clear(clear::Key),
    Aes256Ctr(aes256ctr::SealingKey),
    Aes256Gcm(aes256gcm::SealingKey),
}

impl SealingCipher {
    fn as_sealing_key(&self) -> &dyn SealingKey {
        match *self {
            SealingCipher::Clear(ref key) => key,
            SealingCipher::Aes256Ctr(ref key) => key,
            SealingCipher::Aes256Gcm(ref key) => key,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// Whether the named cipher requires a separately negotiated MAC.
pub fn needs_mac(name: Name) -> bool {
    match name {
        aes256ctr::NAME => true,
        _ => false,
    }
}

pub struct CipherPair {
    pub local_to_remote: SealingCipher,
    pub remote_to_local: OpeningCipher,
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub const CLEAR_PAIR: CipherPair = CipherPair {
    local_to_remote: SealingCipher::Clear(clear::Key),
    remote_to_local: OpeningCipher::Clear(clear::Key),
};

pub trait OpeningKey {
    fn decrypt_packet_length(&self, seqn: u32, encrypted_packet_length: [u8; 4]) -> [u8; 4];

    fn tag_len(&self) -> usize;

    fn open<'a>(
        &self,
        seqn: u32,
        ciphertext_in_plaintext_out: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error>;
}

pub trait SealingKey {
    fn padding_length(&self, plaintext: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);
}

pub async fn read<'a, R: AsyncRead + Unpin>(
    stream: &'a mut R,
    buffer: &'a mut SSHBuffer,
    pair: &'a CipherPair,
) -> Result<usize, Error> {
    if buffer.len == 0 {
        let mut len = [0; 4];
        stream.read_exact(&mut len).await?;
        {
            let key = pair.remote_to_local.as_opening_key();
            let seqn = buffer.seqn.0;
            buffer.buffer.clear();
            buffer.buffer.extend(&len);
            let len = key.decrypt_packet_length(seqn, len);
            buffer.len = BigEndian::read_u32(&len) as usize + key.tag_len();
            debug!("reading, clear len = {:?}", buffer.len);
        }
    }
    buffer.buffer.resize(buffer.len + 4);
    stream.read_exact(&mut buffer.buffer[4..]).await?;
    let key = pair.remote_to_local.as_opening_key();
    let seqn = buffer.seqn.0;
    let ciphertext_len = buffer.buffer.len() - key.tag_len();
    let (ciphertext, tag) = buffer.buffer.split_at_mut(ciphertext_len);
    let plaintext = key.open(seqn, ciphertext, tag)?;

    let padding_length = plaintext[0] as usize;
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .ok_or(Error::IndexOutOfBounds)?;

    buffer.packet_opened();

    // Remove the padding
    buffer.buffer.resize(plaintext_end + 4);

    Ok(plaintext_end + 4)
}

impl CipherPair {
    pub fn write(&self, payload: &[u8], buffer: &mut SSHBuffer) {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length`
        // refer to the protocol fields of the same names.
        let key = self.local_to_remote.as_sealing_key();

        let padding_length = key.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let offset = buffer.buffer.len();

        // Maximum packet length:
        // https://tools.ietf.org/html/rfc4253#section-6.1
        assert!(packet_length <= std::u32::MAX as usize);
        buffer.buffer.push_u32_be(packet_length as u32);

        assert!(padding_length <= std::u8::MAX as usize);
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend(payload);
        key.fill_padding(buffer.buffer.resize_mut(padding_length));
        buffer.buffer.resize_mut(key.tag_len());

        let (plaintext, tag) =
            buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

        key.seal(buffer.seqn.0, plaintext, tag);

        buffer.packet_sealed(payload.len());
    }
}

pub const PACKET_LENGTH_LEN: usize = 4;

const MINIMUM_PACKET_LEN: usize = 16;

const PADDING_LENGTH_LEN: usize = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac;

    fn pair(cipher: &Cipher, mac_name: &'static str) -> (CipherPair, CipherPair) {
        let key = vec![1; cipher.key_len];
        let iv = vec![2; cipher.iv_len];
        let mac_key = vec![3; mac::key_len(mac_name)];
        let a = CipherPair {
            local_to_remote: (cipher.make_sealing_cipher)(
                &key,
                &iv,
                MacKey::new(mac_name, &mac_key),
            ),
            remote_to_local: (cipher.make_opening_cipher)(
                &key,
                &iv,
                MacKey::new(mac_name, &mac_key),
            ),
        };
        let b = CipherPair {
            local_to_remote: (cipher.make_sealing_cipher)(
                &key,
                &iv,
                MacKey::new(mac_name, &mac_key),
            ),
            remote_to_local: (cipher.make_opening_cipher)(
                &key,
                &iv,
                MacKey::new(mac_name, &mac_key),
            ),
        };
        (a, b)
    }

    async fn roundtrip(cipher: &Cipher, mac_name: &'static str) {
        let (sender, receiver) = pair(cipher, mac_name);
        let mut write = SSHBuffer::new();
        // Several packets, so the sequence number moves.
        for i in 0..3u8 {
            let payload = vec![i; 11 + i as usize];
            let before = write.buffer.len();
            sender.write(&payload, &mut write);
            // The encrypted unit, tag excluded, is a multiple of the
            // cipher block size. AEAD ciphers leave the length field
            // out of it (it is authenticated as associated data).
            let framed =
                write.buffer.len() - before - receiver.remote_to_local.as_opening_key().tag_len();
            if needs_mac(cipher.name) {
                assert_eq!(framed % 16, 0);
            } else {
                assert_eq!((framed - PACKET_LENGTH_LEN) % 16, 0);
            }
        }
        assert_eq!(write.seqn.0, 3);

        let mut stream = &write.buffer[..];
        let mut read = SSHBuffer::new();
        for i in 0..3u8 {
            let n = super::read(&mut stream, &mut read, &receiver).await.unwrap();
            let payload = vec![i; 11 + i as usize];
            assert_eq!(&read.buffer[5..n], &payload[..]);
        }
        assert_eq!(read.seqn.0, 3);
    }

    #[tokio::test]
    async fn aes256ctr_hmac_roundtrip() {
        roundtrip(&aes256ctr::CIPHER, mac::HMAC_SHA2_256).await;
        roundtrip(&aes256ctr::CIPHER, mac::HMAC_SHA1).await;
    }

    #[tokio::test]
    async fn aes256gcm_roundtrip() {
        roundtrip(&aes256gcm::CIPHER, mac::NONE).await;
    }

    #[tokio::test]
    async fn corrupted_packet_is_rejected() {
        let (sender, receiver) = pair(&aes256ctr::CIPHER, mac::HMAC_SHA2_256);
        let mut write = SSHBuffer::new();
        sender.write(b"an authenticated payload", &mut write);
        // Flip a payload bit.
        let n = write.buffer.len();
        write.buffer.as_mut()[n - 40] ^= 1;
        let mut stream = &write.buffer[..];
        let mut read = SSHBuffer::new();
        match super::read(&mut stream, &mut read, &receiver).await {
            Err(Error::PacketAuth) => {}
            r => panic!("unexpected result {:?}", r),
        }
    }
}
