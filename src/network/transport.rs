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
use std::sync::Arc;

use crate::message::RpcMessage;
use crate::network::{ConnectionOrientedNetwork, RpcSession};

/// Byte-level I/O capability bound to one session.
///
/// The core never blocks on I/O itself: it hands control to the transport and
/// is re-entered through the session callbacks named below. All methods must
/// return promptly (spawn, don't wait).
pub trait SessionTransport: Send + Sync {
    /// Initiate the connection. On success the transport calls
    /// `session.set_connected()` and starts the read pipeline; on failure it
    /// calls `session.on_disconnected(false)`.
    fn connect(&self, session: &Arc<RpcSession>);

    /// Transmit the session's current batch (`session.sending_buffers()`) as
    /// one gathered write. On completion the transport calls
    /// `session.on_send_completed(sig)`; on failure,
    /// `session.on_disconnected(true)`.
    fn send(&self, session: &Arc<RpcSession>, sig: u64);

    /// Read more bytes. On data the transport feeds
    /// `session.on_read_completed(...)`; on EOF or error it calls
    /// `session.on_disconnected(false)`.
    fn do_read(&self, session: &Arc<RpcSession>, read_next: usize);

    /// Force-close the underlying connection (fault injection path).
    fn close_on_fault_injection(&self, session: &Arc<RpcSession>);
}

/// Creates transports for client sessions the network initiates.
pub trait TransportProvider: Send + Sync {
    fn create_client_transport(&self, remote_addr: SocketAddr) -> Arc<dyn SessionTransport>;
}

/// The RPC engine the network delivers inbound requests to.
pub trait RpcEngine: Send + Sync {
    /// The address this node serves RPC on; used for self-connection
    /// detection.
    fn primary_address(&self) -> SocketAddr;

    fn matcher(&self) -> Arc<dyn ReplyMatcher>;

    fn on_recv_request(
        &self,
        net: &Arc<ConnectionOrientedNetwork>,
        msg: Arc<RpcMessage>,
        delay_ms: u64,
    );
}

/// Matches inbound replies to outstanding requests.
pub trait ReplyMatcher: Send + Sync {
    /// `reply = None` is a synthesized empty reply: the request was drained
    /// from a disconnected session without being sent, and the matcher should
    /// fail it immediately instead of waiting for its timeout.
    fn on_recv_reply(&self, id: u64, reply: Option<Arc<RpcMessage>>, delay_ms: u64);
}
