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

use super::*;
use std::num::Wrapping;

/// One direction of the transport: the byte buffer packets are framed
/// into (or read from), the per-direction packet counter feeding the
/// MAC, and the byte count driving rekey limits.
#[derive(Debug)]
pub struct SSHBuffer {
    pub buffer: CryptoVec,
    /// Length of the packet currently being read, once its length
    /// field has been decrypted; 0 between packets.
    pub len: usize,
    /// Payload bytes since the last key exchange, compared against the
    /// rekey write limit.
    pub bytes: usize,
    /// The packet sequence number of this direction.
    pub seqn: Wrapping<u32>,
}

impl SSHBuffer {
    pub fn new() -> Self {
        SSHBuffer {
            buffer: CryptoVec::new(),
            len: 0,
            bytes: 0,
            seqn: Wrapping(0),
        }
    }

    /// Account for one packet sealed into this direction: the rekey
    /// byte count grows by the payload and the sequence number
    /// advances.
    pub fn packet_sealed(&mut self, payload_len: usize) {
        self.bytes += payload_len;
        self.advance_seqn();
    }

    /// Account for one packet read and opened from the peer: the
    /// pending length clears and the sequence number advances.
    pub fn packet_opened(&mut self) {
        self.len = 0;
        self.advance_seqn();
    }

    // The counter is on 32 bits and wraps; it moves by exactly one per
    // packet and is never reset, not even by a key re-exchange.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    fn advance_seqn(&mut self) {
        self.seqn += Wrapping(1);
    }

    /// Queue the identification line that precedes any binary packet.
    pub fn send_ssh_id(&mut self, id: &[u8]) {
        self.buffer.extend(id);
        self.buffer.push(b'\r');
        self.buffer.push(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_wrap_and_never_reset() {
        let mut write = SSHBuffer::new();
        write.seqn = Wrapping(u32::MAX);
        write.packet_sealed(32);
        assert_eq!(write.seqn.0, 0);
        assert_eq!(write.bytes, 32);
        write.packet_sealed(8);
        assert_eq!(write.seqn.0, 1);
        assert_eq!(write.bytes, 40);

        let mut read = SSHBuffer::new();
        read.len = 256;
        read.packet_opened();
        assert_eq!(read.len, 0);
        assert_eq!(read.seqn.0, 1);
    }

    #[test]
    fn id_line_is_crlf_terminated() {
        let mut buffer = SSHBuffer::new();
        buffer.send_ssh_id(b"SSH-2.0-crussh_0.1.0");
        assert_eq!(&buffer.buffer[..], &b"SSH-2.0-crussh_0.1.0\r\n"[..]);
    }
}
