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

use std::fmt;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::message::RpcMessage;
use crate::network::frame::StoneParser;
use crate::network::MessageReader;
use crate::AppResult;

/// Number of leading bytes inspected to resolve the header format of an
/// inbound byte stream.
pub const HEADER_TYPE_LEN: usize = 4;

/// Token naming a wire header format.
///
/// Formats are process-wide constants; a session resolves one from the first
/// four inbound bytes (or is handed one at construction, for clients).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderFormat(&'static str);

impl HeaderFormat {
    /// Sentinel for "no recognized format".
    pub const INVALID: HeaderFormat = HeaderFormat("NET_HDR_INVALID");
    /// The native framing format shipped with this crate.
    pub const STONE: HeaderFormat = HeaderFormat("NET_HDR_STONE");

    pub const fn new(name: &'static str) -> HeaderFormat {
        HeaderFormat(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }

    /// Resolves a configured format name against the registered parsers.
    /// Unknown names resolve to [`HeaderFormat::INVALID`].
    pub fn from_name(name: &str) -> HeaderFormat {
        if name == Self::INVALID.0 {
            return Self::INVALID;
        }
        PARSER_REGISTRY
            .iter()
            .map(|entry| *entry.key())
            .find(|format| format.0 == name)
            .unwrap_or(Self::INVALID)
    }
}

impl fmt::Display for HeaderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Outcome of binding a parser to a session's inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserStatus {
    /// A parser is bound; framing may proceed.
    Ready,
    /// The reader holds fewer than [`HEADER_TYPE_LEN`] bytes; `n` more are
    /// needed before the format can be resolved.
    NeedMore(usize),
}

/// Frames and deframes messages for one session.
///
/// One parser instance is bound per session; implementations may keep
/// per-stream decode state and are never shared across sessions.
pub trait MessageParser: Send {
    /// Called once per outbound message before it is queued. Implementations
    /// that precompute wire headers do so here.
    fn prepare_on_send(&mut self, msg: &RpcMessage);

    /// Upper bound on the number of gathered buffers `get_buffers_on_send`
    /// will produce for `msg`.
    fn get_buffer_count_on_send(&self, msg: &RpcMessage) -> usize;

    /// Appends the wire buffers for `msg` to `buffers` and returns how many
    /// were appended (may be fewer than `get_buffer_count_on_send` promised,
    /// never more).
    fn get_buffers_on_send(&mut self, msg: &RpcMessage, buffers: &mut Vec<Bytes>) -> usize;

    /// Extracts the next complete message from `reader`, if any. When no
    /// message is complete, `read_next` is set to a hint for how many more
    /// bytes to read.
    fn get_message(
        &mut self,
        reader: &mut MessageReader,
        read_next: &mut usize,
    ) -> AppResult<Option<RpcMessage>>;
}

pub type ParserFactory = fn() -> Box<dyn MessageParser>;

struct ParserRegistration {
    magic: [u8; HEADER_TYPE_LEN],
    factory: ParserFactory,
}

static PARSER_REGISTRY: Lazy<DashMap<HeaderFormat, ParserRegistration>> = Lazy::new(|| {
    let registry = DashMap::new();
    registry.insert(
        HeaderFormat::STONE,
        ParserRegistration {
            magic: StoneParser::MAGIC,
            factory: || Box::new(StoneParser::new()) as Box<dyn MessageParser>,
        },
    );
    registry
});

/// Registers a parser factory for `format`, keyed on its 4-byte wire magic.
/// Re-registering a format replaces the prior entry.
pub fn register_message_parser(
    format: HeaderFormat,
    magic: [u8; HEADER_TYPE_LEN],
    factory: ParserFactory,
) {
    PARSER_REGISTRY.insert(format, ParserRegistration { magic, factory });
}

/// Resolves the header format from the leading bytes of an inbound stream.
/// Returns [`HeaderFormat::INVALID`] when no registered magic matches.
pub fn get_header_type(bytes: &[u8]) -> HeaderFormat {
    if bytes.len() < HEADER_TYPE_LEN {
        return HeaderFormat::INVALID;
    }
    PARSER_REGISTRY
        .iter()
        .find(|entry| entry.value().magic == bytes[..HEADER_TYPE_LEN])
        .map(|entry| *entry.key())
        .unwrap_or(HeaderFormat::INVALID)
}

/// Instantiates a parser for `format`. A missing registration is a
/// programmer error: formats reach this point only after registration or
/// through explicit configuration.
pub fn create_message_parser(format: HeaderFormat) -> Option<Box<dyn MessageParser>> {
    PARSER_REGISTRY
        .get(&format)
        .map(|entry| (entry.value().factory)())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_format_is_registered() {
        assert_eq!(get_header_type(b"STNE\x00\x00"), HeaderFormat::STONE);
        assert!(create_message_parser(HeaderFormat::STONE).is_some());
    }

    #[test]
    fn test_unknown_magic_is_invalid() {
        assert_eq!(get_header_type(b"XXXX"), HeaderFormat::INVALID);
        assert_eq!(get_header_type(b"ST"), HeaderFormat::INVALID);
    }

    #[test]
    fn test_format_name_resolution() {
        assert_eq!(HeaderFormat::from_name("NET_HDR_STONE"), HeaderFormat::STONE);
        assert_eq!(HeaderFormat::from_name("NET_HDR_BOGUS"), HeaderFormat::INVALID);
        assert_eq!(
            HeaderFormat::from_name("NET_HDR_INVALID"),
            HeaderFormat::INVALID
        );
    }
}
