// aes256-gcm@openssh.com, https://tools.ietf.org/html/rfc5647: the
// packet length field stays in clear and is authenticated as
// associated data; the invocation counter in the nonce advances with
// the sequence number.

use crate::mac::MacKey;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use openssl::symm::{decrypt_aead, encrypt_aead};

pub struct OpeningKey {
    key: CryptoVec,
    nonce: [u8; NONCE_LEN],
}

pub struct SealingKey {
    key: CryptoVec,
    nonce: [u8; NONCE_LEN],
}

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const BLOCK_SIZE: usize = 16;

pub const NAME: super::Name = super::Name("aes256-gcm@openssh.com");

pub static CIPHER: super::Cipher = super::Cipher {
    name: NAME,
    key_len: KEY_LEN,
    iv_len: NONCE_LEN,
    needs_mac: false,
    make_sealing_cipher,
    make_opening_cipher,
};

fn make_sealing_cipher(k: &[u8], iv: &[u8], _mac: MacKey) -> super::SealingCipher {
    let mut key = CryptoVec::new();
    key.extend(k);
    let mut nonce = [0; NONCE_LEN];
    nonce.clone_from_slice(iv);
    super::SealingCipher::Aes256Gcm(SealingKey { key, nonce })
}

fn make_opening_cipher(k: &[u8], iv: &[u8], _mac: MacKey) -> super::OpeningCipher {
    let mut key = CryptoVec::new();
    key.extend(k);
    let mut nonce = [0; NONCE_LEN];
    nonce.clone_from_slice(iv);
    super::OpeningCipher::Aes256Gcm(OpeningKey { key, nonce })
}

fn make_nonce(nonce: &[u8; NONCE_LEN], sequence_number: u32) -> [u8; NONCE_LEN] {
    let mut new_nonce = *nonce;
    let i0 = NONCE_LEN - 8;
    let ctr = BigEndian::read_u64(&new_nonce[i0..]);
    BigEndian::write_u64(
        &mut new_nonce[i0..],
        ctr.wrapping_add(sequence_number as u64),
    );
    new_nonce
}

impl super::OpeningKey for OpeningKey {
    fn decrypt_packet_length(
        &self,
        _sequence_number: u32,
        encrypted_packet_length: [u8; 4],
    ) -> [u8; 4] {
        encrypted_packet_length
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn open<'a>(
        &self,
        sequence_number: u32,
        ciphertext_in_plaintext_out: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error> {
        let nonce = make_nonce(&self.nonce, sequence_number);
        let (length, ciphertext) =
            ciphertext_in_plaintext_out.split_at_mut(super::PACKET_LENGTH_LEN);
        let plaintext = decrypt_aead(
            openssl::symm::Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            length,
            ciphertext,
            tag,
        )
        .map_err(|_| Error::PacketAuth)?;
        ciphertext.clone_from_slice(&plaintext);
        Ok(&ciphertext_in_plaintext_out[super::PACKET_LENGTH_LEN..])
    }
}

impl super::SealingKey for SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let extra_len = super::PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN;
        let padding_len = if payload.len() + extra_len <= super::MINIMUM_PACKET_LEN {
            super::MINIMUM_PACKET_LEN - payload.len() - super::PADDING_LENGTH_LEN
        } else {
            BLOCK_SIZE - ((super::PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE)
        };
        if padding_len < super::PACKET_LENGTH_LEN {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn seal(
        &self,
        sequence_number: u32,
        plaintext_in_ciphertext_out: &mut [u8],
        tag_out: &mut [u8],
    ) {
        let nonce = make_nonce(&self.nonce, sequence_number);
        let (length, plaintext) =
            plaintext_in_ciphertext_out.split_at_mut(super::PACKET_LENGTH_LEN);
        let mut tag = [0; TAG_LEN];
        let ciphertext = encrypt_aead(
            openssl::symm::Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            length,
            plaintext,
            &mut tag,
        )
        .expect("aes256gcm seal");
        plaintext.clone_from_slice(&ciphertext);
        tag_out.clone_from_slice(&tag);
    }
}
