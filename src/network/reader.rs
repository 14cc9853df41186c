// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::BytesMut;

/// Accumulator for inbound bytes, consumed by a message parser.
///
/// Grows in block-sized steps so steady-state reads do not reallocate.
#[derive(Debug)]
pub struct MessageReader {
    buffer: BytesMut,
    block_size: usize,
}

impl MessageReader {
    pub fn new(block_size: usize) -> MessageReader {
        MessageReader {
            buffer: BytesMut::with_capacity(block_size),
            block_size,
        }
    }

    /// Number of buffered bytes not yet consumed by the parser.
    pub fn occupied(&self) -> usize {
        self.buffer.len()
    }

    pub fn append(&mut self, data: &[u8]) {
        if self.buffer.capacity() - self.buffer.len() < data.len() {
            self.buffer.reserve(self.block_size.max(data.len()));
        }
        self.buffer.extend_from_slice(data);
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access for parsers, which consume leading bytes via `Buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn test_append_and_consume() {
        let mut reader = MessageReader::new(16);
        reader.append(b"hello ");
        reader.append(b"world");
        assert_eq!(reader.occupied(), 11);
        assert_eq!(reader.buffer(), b"hello world");

        reader.buffer_mut().advance(6);
        assert_eq!(reader.buffer(), b"world");
        assert_eq!(reader.occupied(), 5);
    }

    #[test]
    fn test_grows_past_block_size() {
        let mut reader = MessageReader::new(4);
        let data = vec![7u8; 64];
        reader.append(&data);
        assert_eq!(reader.occupied(), 64);
    }
}
