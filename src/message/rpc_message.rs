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
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::MessageHeader;
use crate::network::RpcSession;

/// A logical RPC message: header plus zero or more payload fragments.
///
/// Messages are shared via `Arc`. The owning session's send queue holds one
/// `Arc` clone per enqueued message; dropping that clone is the release that
/// ends the message's queued life. The `io_session` back-reference is a
/// non-owning `Weak` used to validate cancellation and to route replies back
/// through the session a request arrived on; it never keeps a session alive.
#[derive(Debug)]
pub struct RpcMessage {
    pub header: MessageHeader,
    pub to_address: Option<SocketAddr>,
    pub payload: Vec<Bytes>,
    io_session: Mutex<Weak<RpcSession>>,
}

impl RpcMessage {
    pub fn new(header: MessageHeader, to_address: Option<SocketAddr>, payload: Vec<Bytes>) -> Self {
        RpcMessage {
            header,
            to_address,
            payload,
            io_session: Mutex::new(Weak::new()),
        }
    }

    /// Total payload size in bytes across all fragments.
    pub fn body_size(&self) -> usize {
        self.payload.iter().map(|b| b.len()).sum()
    }

    pub fn is_request(&self) -> bool {
        self.header.context.is_request
    }

    pub fn is_forwarded(&self) -> bool {
        self.header.context.is_forwarded
    }

    /// The session this message is currently bound to, if it is still alive.
    pub fn session(&self) -> Option<Arc<RpcSession>> {
        self.io_session.lock().upgrade()
    }

    pub(crate) fn bind_session(&self, session: &Arc<RpcSession>) {
        *self.io_session.lock() = Arc::downgrade(session);
    }

    pub(crate) fn clear_session(&self) {
        *self.io_session.lock() = Weak::new();
    }
}
