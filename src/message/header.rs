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

use std::net::SocketAddr;

/// Routing flags carried by every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageContext {
    /// true for requests, false for replies
    pub is_request: bool,
    /// true when the request was relayed through an intermediate node; the
    /// relay must not fail it on local disconnect
    pub is_forwarded: bool,
}

/// Wire-visible message header.
///
/// `id` is unique per request and is what the reply matcher keys on.
/// `from_address` is `None` until the sender (or the receiving session, for
/// inbound messages that omitted it) fills it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u64,
    pub context: MessageContext,
    pub from_address: Option<SocketAddr>,
}

impl MessageHeader {
    pub fn request(id: u64) -> Self {
        MessageHeader {
            id,
            context: MessageContext {
                is_request: true,
                is_forwarded: false,
            },
            from_address: None,
        }
    }

    pub fn forwarded_request(id: u64) -> Self {
        MessageHeader {
            id,
            context: MessageContext {
                is_request: true,
                is_forwarded: true,
            },
            from_address: None,
        }
    }

    pub fn reply(id: u64) -> Self {
        MessageHeader {
            id,
            context: MessageContext {
                is_request: false,
                is_forwarded: false,
            },
            from_address: None,
        }
    }
}
