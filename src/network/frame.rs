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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::{MessageContext, MessageHeader, RpcMessage};
use crate::network::{MessageParser, MessageReader};
use crate::{AppError, AppResult};

const FLAG_REQUEST: u32 = 1 << 0;
const FLAG_FORWARDED: u32 = 1 << 1;
const FLAG_HAS_FROM: u32 = 1 << 2;

/// Fixed wire prefix: magic(4) + body_len(4) + id(8) + flags(4) + from ip(4)
/// + from port(2).
const FRAME_HEADER_SIZE: usize = 26;

/// Upper bound on a single frame body; larger frames are treated as protocol
/// corruption and close the session.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// The native framing format.
///
/// A frame is a fixed binary prefix followed by the message body. The send
/// side emits one prefix buffer plus the message's payload fragments
/// unchanged; the receive side yields the body as a single buffer.
/// `from_address` travels as an IPv4 address and port (IPv6 senders omit it
/// and let the receiving session stamp the peer address instead).
#[derive(Debug, Default)]
pub struct StoneParser;

impl StoneParser {
    pub const MAGIC: [u8; 4] = *b"STNE";

    pub fn new() -> StoneParser {
        StoneParser
    }
}

impl MessageParser for StoneParser {
    fn prepare_on_send(&mut self, _msg: &RpcMessage) {
        // the wire prefix is derived at batch time, nothing to precompute
    }

    fn get_buffer_count_on_send(&self, msg: &RpcMessage) -> usize {
        1 + msg.payload.len()
    }

    fn get_buffers_on_send(&mut self, msg: &RpcMessage, buffers: &mut Vec<Bytes>) -> usize {
        let mut prefix = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        prefix.put_slice(&Self::MAGIC);
        prefix.put_u32(msg.body_size() as u32);
        prefix.put_u64(msg.header.id);

        let mut flags = 0u32;
        if msg.header.context.is_request {
            flags |= FLAG_REQUEST;
        }
        if msg.header.context.is_forwarded {
            flags |= FLAG_FORWARDED;
        }
        let (ip, port) = match msg.header.from_address {
            Some(SocketAddr::V4(addr)) => {
                flags |= FLAG_HAS_FROM;
                (u32::from(*addr.ip()), addr.port())
            }
            _ => (0, 0),
        };
        prefix.put_u32(flags);
        prefix.put_u32(ip);
        prefix.put_u16(port);

        buffers.push(prefix.freeze());
        for fragment in &msg.payload {
            buffers.push(fragment.clone());
        }
        1 + msg.payload.len()
    }

    fn get_message(
        &mut self,
        reader: &mut MessageReader,
        read_next: &mut usize,
    ) -> AppResult<Option<RpcMessage>> {
        // perform a check to ensure we have a complete frame
        match Self::check(reader, read_next) {
            Ok(()) => Ok(Some(Self::parse(reader, read_next))),
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl StoneParser {
    fn check(reader: &MessageReader, read_next: &mut usize) -> AppResult<()> {
        let occupied = reader.occupied();
        if occupied < FRAME_HEADER_SIZE {
            *read_next = FRAME_HEADER_SIZE - occupied;
            return Err(AppError::Incomplete);
        }

        let buffer = reader.buffer();
        if buffer[..4] != Self::MAGIC {
            return Err(AppError::MalformedProtocol(format!(
                "bad frame magic {:02x?}",
                &buffer[..4]
            )));
        }
        let body_len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(AppError::FrameTooLarge(body_len));
        }
        if occupied < FRAME_HEADER_SIZE + body_len {
            *read_next = FRAME_HEADER_SIZE + body_len - occupied;
            return Err(AppError::Incomplete);
        }
        Ok(())
    }

    /// Consumes one complete frame; `check` has already validated it.
    fn parse(reader: &mut MessageReader, read_next: &mut usize) -> RpcMessage {
        let mut prefix = reader.buffer_mut().split_to(FRAME_HEADER_SIZE);
        prefix.advance(4); // magic
        let body_len = prefix.get_u32() as usize;
        let id = prefix.get_u64();
        let flags = prefix.get_u32();
        let ip = prefix.get_u32();
        let port = prefix.get_u16();

        let from_address = if flags & FLAG_HAS_FROM != 0 {
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        } else {
            None
        };
        let header = MessageHeader {
            id,
            context: MessageContext {
                is_request: flags & FLAG_REQUEST != 0,
                is_forwarded: flags & FLAG_FORWARDED != 0,
            },
            from_address,
        };

        let payload = if body_len > 0 {
            vec![reader.buffer_mut().split_to(body_len).freeze()]
        } else {
            Vec::new()
        };
        *read_next = FRAME_HEADER_SIZE;
        RpcMessage::new(header, None, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &RpcMessage) -> Vec<u8> {
        let mut parser = StoneParser::new();
        let mut buffers = Vec::new();
        let count = parser.get_buffers_on_send(msg, &mut buffers);
        assert_eq!(count, parser.get_buffer_count_on_send(msg));
        buffers.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn test_frame_round_trip() {
        let mut header = MessageHeader::request(42);
        header.from_address = Some("10.0.0.1:7".parse().unwrap());
        let msg = RpcMessage::new(header, None, vec![Bytes::from_static(b"ping")]);

        let wire = encode(&msg);
        let mut reader = MessageReader::new(64);
        reader.append(&wire);

        let mut parser = StoneParser::new();
        let mut read_next = 0;
        let decoded = parser
            .get_message(&mut reader, &mut read_next)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.header.id, 42);
        assert!(decoded.is_request());
        assert!(!decoded.is_forwarded());
        assert_eq!(decoded.header.from_address, msg.header.from_address);
        assert_eq!(decoded.payload.len(), 1);
        assert_eq!(&decoded.payload[0][..], b"ping");
        assert_eq!(reader.occupied(), 0);
        assert_eq!(read_next, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_partial_frame_reports_missing_bytes() {
        let msg = RpcMessage::new(
            MessageHeader::reply(7),
            None,
            vec![Bytes::from_static(b"pong")],
        );
        let wire = encode(&msg);

        let mut parser = StoneParser::new();
        let mut reader = MessageReader::new(64);
        let mut read_next = 0;

        reader.append(&wire[..3]);
        assert!(parser
            .get_message(&mut reader, &mut read_next)
            .unwrap()
            .is_none());
        assert_eq!(read_next, FRAME_HEADER_SIZE - 3);

        reader.append(&wire[3..FRAME_HEADER_SIZE + 1]);
        assert!(parser
            .get_message(&mut reader, &mut read_next)
            .unwrap()
            .is_none());
        assert_eq!(read_next, 3);

        reader.append(&wire[FRAME_HEADER_SIZE + 1..]);
        let decoded = parser
            .get_message(&mut reader, &mut read_next)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.header.id, 7);
        assert!(!decoded.is_request());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut reader = MessageReader::new(64);
        reader.append(&[0xffu8; FRAME_HEADER_SIZE]);
        let mut parser = StoneParser::new();
        let mut read_next = 0;
        assert!(matches!(
            parser.get_message(&mut reader, &mut read_next),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&StoneParser::MAGIC);
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        wire.extend_from_slice(&[0u8; FRAME_HEADER_SIZE - 8]);

        let mut reader = MessageReader::new(64);
        reader.append(&wire);
        let mut parser = StoneParser::new();
        let mut read_next = 0;
        assert!(matches!(
            parser.get_message(&mut reader, &mut read_next),
            Err(AppError::FrameTooLarge(_))
        ));
    }
}
