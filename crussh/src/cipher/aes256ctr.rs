// aes256-ctr with a separately negotiated MAC, encrypt-and-MAC as in
// https://tools.ietf.org/html/rfc4253#section-6: the MAC covers the
// sequence number and the plaintext packet, the whole packet
// (including its length field) is encrypted with the keystream.

use crate::mac::MacKey;
use crate::Error;
use aes::cipher::{NewCipher, StreamCipher, StreamCipherSeek};
use aes::Aes256Ctr;
use generic_array::GenericArray;
use rand::RngCore;
use std::sync::Mutex;

pub struct OpeningKey {
    cipher: Mutex<Aes256Ctr>,
    mac: MacKey,
}

pub struct SealingKey {
    cipher: Mutex<Aes256Ctr>,
    mac: MacKey,
}

const BLOCK_SIZE: usize = 16;

pub const NAME: super::Name = super::Name("aes256-ctr");

pub static CIPHER: super::Cipher = super::Cipher {
    name: NAME,
    key_len: 32,
    iv_len: 16,
    needs_mac: true,
    make_sealing_cipher,
    make_opening_cipher,
};

fn make_sealing_cipher(k: &[u8], iv: &[u8], mac: MacKey) -> super::SealingCipher {
    let cipher = Aes256Ctr::new(GenericArray::from_slice(k), GenericArray::from_slice(iv));
    super::SealingCipher::Aes256Ctr(SealingKey {
        cipher: Mutex::new(cipher),
        mac,
    })
}

fn make_opening_cipher(k: &[u8], iv: &[u8], mac: MacKey) -> super::OpeningCipher {
    let cipher = Aes256Ctr::new(GenericArray::from_slice(k), GenericArray::from_slice(iv));
    super::OpeningCipher::Aes256Ctr(OpeningKey {
        cipher: Mutex::new(cipher),
        mac,
    })
}

impl super::OpeningKey for OpeningKey {
    fn decrypt_packet_length(&self, _seqn: u32, encrypted_packet_length: [u8; 4]) -> [u8; 4] {
        // Peek at the keystream without consuming it: the same bytes
        // are decrypted again in `open`.
        let mut len = encrypted_packet_length;
        if let Ok(mut cipher) = self.cipher.lock() {
            let pos: u64 = cipher.current_pos();
            cipher.apply_keystream(&mut len);
            cipher.seek(pos);
        }
        len
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open<'a>(
        &self,
        seqn: u32,
        ciphertext_in_plaintext_out: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error> {
        {
            let mut cipher = self.cipher.lock().map_err(|_| Error::DecryptionError)?;
            cipher.apply_keystream(ciphertext_in_plaintext_out);
        }
        if !self.mac.verify(seqn, ciphertext_in_plaintext_out, tag) {
            return Err(Error::PacketAuth);
        }
        Ok(&ciphertext_in_plaintext_out[super::PACKET_LENGTH_LEN..])
    }
}

impl super::SealingKey for SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let extra_len = super::PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN;
        let padding_len = BLOCK_SIZE - ((extra_len + payload.len()) % BLOCK_SIZE);
        if padding_len < super::PACKET_LENGTH_LEN {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn seal(&self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        self.mac.compute(seqn, plaintext_in_ciphertext_out, tag_out);
        if let Ok(mut cipher) = self.cipher.lock() {
            cipher.apply_keystream(plaintext_in_ciphertext_out);
        }
    }
}
