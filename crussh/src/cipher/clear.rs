// The null cipher of the pre-kex phase. Version exchange, KEXINIT and
// the key exchange itself travel under it: packets are framed but not
// encrypted, and carry no authentication tag until the first NEWKEYS
// installs real keys.

use crate::Error;

// With no cipher the framing stays on the protocol-wide minimum of
// max(8, cipher block size) = 8.
const BLOCK_SIZE: usize = 8;

#[derive(Debug)]
pub struct Key;

impl super::OpeningKey for Key {
    fn decrypt_packet_length(&self, _seqn: u32, packet_length: [u8; 4]) -> [u8; 4] {
        packet_length
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open<'a>(
        &self,
        _seqn: u32,
        ciphertext_in_plaintext_out: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error> {
        debug_assert_eq!(tag.len(), 0);
        Ok(&ciphertext_in_plaintext_out[super::PACKET_LENGTH_LEN..])
    }
}

impl super::SealingKey for Key {
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
        // Since the packet is unencrypted anyway, there's no advantage to
        // randomizing the padding, so avoid possibly leaking extra RNG state
        // by padding with zeros.
        for padding_byte in padding_out {
            *padding_byte = 0;
        }
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&self, _seqn: u32, _plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        debug_assert_eq!(tag_out.len(), self.tag_len());
    }
}

#[cfg(test)]
mod tests {
    use super::Key;
    use crate::cipher::{OpeningKey, SealingKey};

    #[test]
    fn framing_stays_on_the_minimum_block() {
        for len in 0..70 {
            let payload = vec![0; len];
            let padding = SealingKey::padding_length(&Key, &payload);
            // At least four bytes of padding, and the whole framed
            // unit lands on the eight-byte boundary.
            assert!(padding >= 4);
            assert_eq!((4 + 1 + len + padding) % 8, 0);
        }
    }

    #[test]
    fn no_tag_before_the_first_kex() {
        // The MAC is empty until the first key exchange has run.
        assert_eq!(SealingKey::tag_len(&Key), 0);
        assert_eq!(OpeningKey::tag_len(&Key), 0);
    }
}
