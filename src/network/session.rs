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

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::message::RpcMessage;
use crate::network::join_point::{ON_RPC_SESSION_CONNECTED, ON_RPC_SESSION_DISCONNECTED};
use crate::network::parser::{get_header_type, HeaderFormat, ParserStatus, HEADER_TYPE_LEN};
use crate::network::{
    ConnectionOrientedNetwork, MessageParser, MessageReader, ReplyMatcher, SessionTransport,
};
use crate::{AppError, AppResult};

/// Read hint used when no parser has told us better.
pub const READ_NEXT_DEFAULT: usize = 256;

/// Connection state of a session.
///
/// Client sessions are born Disconnected and walk Disconnected → Connecting →
/// Connected at most once; a re-connect is always a new session. Server
/// sessions are born Connected. Disconnected after a failure is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the session lock protects.
///
/// Invariants (hold whenever the lock is released):
/// - a message is in `messages` or `sending_msgs`, never both;
/// - `is_sending_next` implies a batch is outstanding with the transport, or
///   the session was disconnected mid-flight and the next completion clears;
/// - `sending_buffers` is the flattened gather list for `sending_msgs`.
struct SessionState {
    connect_state: ConnectState,
    /// pending outbound messages, in enqueue order; each entry is the one
    /// reference the session owns until the message is sent, cancelled or
    /// drained
    messages: VecDeque<Arc<RpcMessage>>,
    /// messages currently handed to the transport
    sending_msgs: Vec<Arc<RpcMessage>>,
    sending_buffers: Vec<Bytes>,
    is_sending_next: bool,
    /// completed message count; the next batch signature is `message_sent + 1`
    message_sent: u64,
    reader: MessageReader,
}

impl SessionState {
    /// Moves a greedy batch from `messages` into `sending_msgs`, flattening
    /// wire buffers into `sending_buffers`. The batch is cut when adding the
    /// next message would exceed `max_block_count` buffers, except that a
    /// single message larger than the cap still goes out alone.
    fn unlink_message_for_send(
        &mut self,
        parser: &mut dyn MessageParser,
        max_block_count: usize,
    ) -> bool {
        debug_assert!(self.sending_buffers.is_empty());
        debug_assert!(self.sending_msgs.is_empty());

        let mut batched = 0usize;
        while let Some(msg) = self.messages.pop_front() {
            let count = parser.get_buffer_count_on_send(&msg);
            if batched > 0 && batched + count > max_block_count {
                self.messages.push_front(msg);
                break;
            }
            let written = parser.get_buffers_on_send(&msg, &mut self.sending_buffers);
            debug_assert!(written <= count);
            batched += written;
            self.sending_msgs.push(msg);
        }
        !self.sending_msgs.is_empty()
    }
}

/// A long-lived bidirectional channel to one peer address.
///
/// Outbound: `send_message` queues, and at most one write batch is in flight
/// per session (`is_sending_next`); completion of one batch triggers the
/// next. Inbound: the transport feeds bytes through `on_read_completed`,
/// which lazily binds a parser from the leading header magic and dispatches
/// framed messages to the engine (requests) or the reply matcher (replies).
///
/// The state lock is held only for short critical sections and never across
/// engine, matcher, transport or join-point callbacks. The parser sits under
/// its own lock so `prepare_on_send` runs before the state lock is taken.
pub struct RpcSession {
    net: Arc<ConnectionOrientedNetwork>,
    remote_addr: SocketAddr,
    is_client: bool,
    max_buffer_block_count_per_send: usize,
    matcher: Arc<dyn ReplyMatcher>,
    transport: Arc<dyn SessionTransport>,
    /// read throttle in milliseconds, consumed and cleared by the next
    /// `start_read_next` (server sessions only)
    delay_server_receive_ms: AtomicU64,
    /// bound lazily on first inbound bytes (server) or at construction
    /// (client); always the inner lock when nested with the state lock
    parser: Mutex<Option<Box<dyn MessageParser>>>,
    state: Mutex<SessionState>,
}

impl RpcSession {
    pub(crate) fn new_client(
        net: Arc<ConnectionOrientedNetwork>,
        remote_addr: SocketAddr,
        transport: Arc<dyn SessionTransport>,
    ) -> Arc<RpcSession> {
        let parser = net.new_message_parser(net.client_hdr_format());
        let reader = MessageReader::new(net.message_buffer_block_size());
        Arc::new(RpcSession {
            remote_addr,
            is_client: true,
            max_buffer_block_count_per_send: net.max_buffer_block_count_per_send(),
            matcher: net.engine().matcher(),
            transport,
            delay_server_receive_ms: AtomicU64::new(0),
            parser: Mutex::new(Some(parser)),
            state: Mutex::new(SessionState {
                connect_state: ConnectState::Disconnected,
                messages: VecDeque::new(),
                sending_msgs: Vec::new(),
                sending_buffers: Vec::new(),
                is_sending_next: false,
                message_sent: 0,
                reader,
            }),
            net,
        })
    }

    pub(crate) fn new_server(
        net: Arc<ConnectionOrientedNetwork>,
        remote_addr: SocketAddr,
        transport: Arc<dyn SessionTransport>,
    ) -> Arc<RpcSession> {
        let reader = MessageReader::new(net.message_buffer_block_size());
        let session = Arc::new(RpcSession {
            remote_addr,
            is_client: false,
            max_buffer_block_count_per_send: net.max_buffer_block_count_per_send(),
            matcher: net.engine().matcher(),
            transport,
            delay_server_receive_ms: AtomicU64::new(0),
            parser: Mutex::new(None),
            state: Mutex::new(SessionState {
                connect_state: ConnectState::Connected,
                messages: VecDeque::new(),
                sending_msgs: Vec::new(),
                sending_buffers: Vec::new(),
                is_sending_next: false,
                message_sent: 0,
                reader,
            }),
            net,
        });
        ON_RPC_SESSION_CONNECTED.execute(session.as_ref());
        session
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn connect_state(&self) -> ConnectState {
        self.state.lock().connect_state
    }

    /// Completed message count; the next batch signature is this plus one.
    pub fn message_sent(&self) -> u64 {
        self.state.lock().message_sent
    }

    pub fn has_pending_out_msgs(&self) -> bool {
        !self.state.lock().messages.is_empty()
    }

    pub fn pending_message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Snapshot of the gather list for the batch currently in flight.
    /// Transports read this when executing `send(sig)`.
    pub fn sending_buffers(&self) -> Vec<Bytes> {
        self.state.lock().sending_buffers.clone()
    }

    // ---------------------------------------------------------------------
    // connect state machine
    // ---------------------------------------------------------------------

    /// Initiates the transport connect unless one is already under way.
    pub fn connect(self: &Arc<Self>) {
        debug_assert!(self.is_client, "must be client session");
        if self.try_connecting() {
            self.transport.connect(self);
        }
    }

    /// Disconnected → Connecting. Returns false when another caller already
    /// moved the session past Disconnected; only the winner may initiate the
    /// transport connect.
    pub fn try_connecting(&self) -> bool {
        debug_assert!(self.is_client, "must be client session");
        let mut state = self.state.lock();
        if state.connect_state == ConnectState::Disconnected {
            state.connect_state = ConnectState::Connecting;
            true
        } else {
            false
        }
    }

    pub fn set_connected(self: &Arc<Self>) {
        assert!(self.is_client, "must be client session");
        {
            let mut state = self.state.lock();
            assert!(
                state.connect_state == ConnectState::Connecting,
                "session must be connecting"
            );
            state.connect_state = ConnectState::Connected;
        }

        self.net.on_client_session_connected(self);
        ON_RPC_SESSION_CONNECTED.execute(self.as_ref());

        // flush whatever queued up while the connect was in flight
        self.on_send_completed(0);
    }

    /// Moves the session to Disconnected. Returns true exactly once per
    /// session lifetime.
    pub fn set_disconnected(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.connect_state == ConnectState::Disconnected {
                return false;
            }
            state.connect_state = ConnectState::Disconnected;
        }

        ON_RPC_SESSION_DISCONNECTED.execute(self.as_ref());
        true
    }

    /// Transport-facing disconnect entry. `is_write` means the failure was
    /// observed while writing, in which case the send queue is drained and
    /// unreplied requests are failed fast.
    pub fn on_disconnected(self: &Arc<Self>, is_write: bool) -> bool {
        let newly_disconnected = if self.set_disconnected() {
            if self.is_client {
                self.net.on_client_session_disconnected(self);
            } else {
                self.net.on_server_session_disconnected(self);
            }
            true
        } else {
            false
        };

        if is_write {
            self.clear_send_queue(false);
        }
        newly_disconnected
    }

    pub fn close_on_fault_injection(self: &Arc<Self>) {
        self.transport.close_on_fault_injection(self);
    }

    // ---------------------------------------------------------------------
    // outbound pipeline
    // ---------------------------------------------------------------------

    /// Queues `msg` for transmission. When the session is Connected and no
    /// batch is outstanding, the message (plus anything queued ahead of it)
    /// goes out immediately; otherwise it waits for the post-connect flush or
    /// the next batch completion, or is drained on disconnect.
    pub fn send_message(self: &Arc<Self>, msg: Arc<RpcMessage>) {
        msg.bind_session(self);
        self.parser
            .lock()
            .as_mut()
            .expect("parser should not be null when send")
            .prepare_on_send(&msg);

        let sig = {
            let mut state = self.state.lock();
            state.messages.push_back(msg.clone());

            if state.connect_state == ConnectState::Connected && !state.is_sending_next {
                state.is_sending_next = true;
                let sig = state.message_sent + 1;
                self.unlink_next_batch(&mut state);
                Some(sig)
            } else {
                None
            }
        };

        if let Some(sig) = sig {
            self.send(sig);
        }
    }

    /// Builds the next batch under the state lock, borrowing the parser
    /// through its own (inner) lock.
    fn unlink_next_batch(&self, state: &mut SessionState) -> bool {
        let mut parser = self.parser.lock();
        match parser.as_mut() {
            Some(parser) => state
                .unlink_message_for_send(parser.as_mut(), self.max_buffer_block_count_per_send),
            None => false,
        }
    }

    fn send(self: &Arc<Self>, sig: u64) {
        self.transport.send(self, sig);
    }

    /// Called by the transport when the write for `signature` finishes.
    /// `signature = 0` acknowledges nothing and merely kicks the next batch
    /// if one can be built (the post-connect flush path).
    pub fn on_send_completed(self: &Arc<Self>, signature: u64) {
        let mut next_sig = 0u64;
        {
            let mut state = self.state.lock();
            if signature != 0 {
                assert!(
                    state.is_sending_next && signature == state.message_sent + 1,
                    "sent msg must be sending"
                );
                state.is_sending_next = false;

                // the sending queue may have been cleared while this write
                // was failing on the read side of the session
                if state.sending_msgs.is_empty() {
                    assert!(
                        state.connect_state == ConnectState::Disconnected,
                        "assume sending queue is cleared due to session closed"
                    );
                    return;
                }

                state.message_sent += state.sending_msgs.len() as u64;
                state.sending_msgs.clear();
                state.sending_buffers.clear();
            }

            if !state.is_sending_next && self.unlink_next_batch(&mut state) {
                next_sig = state.message_sent + 1;
                state.is_sending_next = true;
            }
        }

        if next_sig != 0 {
            self.send(next_sig);
        }
    }

    /// Removes a queued message before it is batched. Fails when `request`
    /// is not bound to this session or has already been handed to the
    /// transport.
    pub fn cancel(self: &Arc<Self>, request: &Arc<RpcMessage>) -> bool {
        match request.session() {
            Some(owner) if Arc::ptr_eq(&owner, self) => {}
            _ => return false,
        }

        {
            let mut state = self.state.lock();
            let Some(pos) = state
                .messages
                .iter()
                .position(|queued| Arc::ptr_eq(queued, request))
            else {
                return false;
            };
            let _ = state.messages.remove(pos);
        }

        request.clear_session();
        true
    }

    /// Empties both send queues. With `resend_msgs` the messages are routed
    /// back through the network (which may land them on a fresh session);
    /// otherwise every unreplied, non-forwarded request is failed immediately
    /// with a synthesized empty reply so callers do not sit out the timeout.
    ///
    /// Concurrent resends do not preserve the original enqueue order; the
    /// inbound side gives no ordering guarantee either, so none is promised
    /// here.
    pub fn clear_send_queue(&self, resend_msgs: bool) {
        let swapped_sending_msgs = {
            let mut state = self.state.lock();
            state.sending_buffers.clear();
            std::mem::take(&mut state.sending_msgs)
        };

        for msg in swapped_sending_msgs {
            if resend_msgs {
                self.net.send_message(msg);
            } else if msg.is_request() && !msg.is_forwarded() {
                self.matcher.on_recv_reply(msg.header.id, None, 0);
            }
        }

        loop {
            let msg = { self.state.lock().messages.pop_front() };
            let Some(msg) = msg else {
                break;
            };
            msg.clear_session();

            if resend_msgs {
                self.net.send_message(msg);
            } else if msg.is_request() && !msg.is_forwarded() {
                self.matcher.on_recv_reply(msg.header.id, None, 0);
            }
        }
    }

    // ---------------------------------------------------------------------
    // inbound pipeline
    // ---------------------------------------------------------------------

    /// Feeds freshly read bytes into the framing pipeline and dispatches
    /// every completed message. Returns the hint for the next read, or an
    /// error when the session must be closed (unresolvable header format,
    /// corrupt frame, self-connection).
    pub fn on_read_completed(self: &Arc<Self>, data: &[u8]) -> AppResult<usize> {
        let mut read_next = READ_NEXT_DEFAULT;
        let mut received = Vec::new();
        {
            let mut state = self.state.lock();
            state.reader.append(data);

            if self.parser.lock().is_none() {
                match self.prepare_parser(&mut state)? {
                    ParserStatus::Ready => {}
                    ParserStatus::NeedMore(needed) => return Ok(needed),
                }
            }

            let mut parser = self.parser.lock();
            if let Some(parser) = parser.as_mut() {
                while let Some(msg) = parser.get_message(&mut state.reader, &mut read_next)? {
                    received.push(msg);
                }
            }
        }

        for msg in received {
            if !self.on_recv_message(msg, 0) {
                return Err(AppError::SelfConnection(self.remote_addr));
            }
        }
        Ok(read_next)
    }

    /// Binds a parser from the leading header-format magic, falling back to
    /// the configured unknown-format default.
    fn prepare_parser(&self, state: &mut SessionState) -> AppResult<ParserStatus> {
        let occupied = state.reader.occupied();
        if occupied < HEADER_TYPE_LEN {
            return Ok(ParserStatus::NeedMore(HEADER_TYPE_LEN - occupied));
        }

        let mut hdr_format = get_header_type(state.reader.buffer());
        if hdr_format == HeaderFormat::INVALID {
            hdr_format = self.net.unknown_msg_hdr_format();
            if hdr_format == HeaderFormat::INVALID {
                error!(
                    "invalid message header type, remote_client = {}, leading bytes = {:02x?}",
                    self.remote_addr,
                    &state.reader.buffer()[..HEADER_TYPE_LEN]
                );
                return Err(AppError::MalformedProtocol(
                    "unrecognized message header format".to_string(),
                ));
            }
        }

        *self.parser.lock() = Some(self.net.new_message_parser(hdr_format));
        debug!(
            "message parser created, remote_client = {}, header_format = {}",
            self.remote_addr, hdr_format
        );
        Ok(ParserStatus::Ready)
    }

    /// Kicks the next read, honoring the server-side receive throttle: a
    /// pending delay is consumed atomically and the read is deferred through
    /// the scheduler, with the task holding a strong session handle until it
    /// runs.
    pub fn start_read_next(self: &Arc<Self>, read_next: usize) {
        if !self.is_client {
            let delay_ms = self.delay_server_receive_ms.swap(0, Ordering::Relaxed);
            if delay_ms > 0 {
                let session = self.clone();
                self.net.scheduler().after(
                    Duration::from_millis(delay_ms),
                    Box::new(move || {
                        session.start_read_next(READ_NEXT_DEFAULT);
                    }),
                );
                return;
            }
        }
        self.transport.do_read(self, read_next);
    }

    /// Asks the session to pause reading for `delay_ms` before its next read
    /// (server sessions only; the engine uses this to shed inbound load).
    pub fn delay_recv(&self, delay_ms: u64) {
        self.delay_server_receive_ms
            .store(delay_ms, Ordering::Relaxed);
    }

    /// Routes one framed inbound message. Returns false when the message was
    /// dropped because it revealed a self-connection, in which case the
    /// caller closes the session.
    pub fn on_recv_message(self: &Arc<Self>, mut msg: RpcMessage, delay_ms: u64) -> bool {
        if msg.header.from_address.is_none() {
            msg.header.from_address = Some(self.remote_addr);
        }
        msg.to_address = Some(self.net.address());

        if msg.is_request() {
            // Connecting to an unoccupied port on the same host can hand the
            // OS-chosen ephemeral port back as the remote port, looping the
            // stream onto itself: a client session then reads its own
            // request.
            if self.is_client
                && msg.header.from_address == Some(self.net.engine().primary_address())
            {
                error!(
                    "self connection detected, address = {}",
                    self.net.engine().primary_address()
                );
                // msg is owned here and goes down with this frame
                return false;
            }

            debug_assert!(!self.is_client, "only rpc server session can recv rpc requests");
            let msg = Arc::new(msg);
            msg.bind_session(self);
            self.net.engine().on_recv_request(&self.net, msg, delay_ms);
        } else {
            // both session kinds receive replies: client sessions the general
            // case, server sessions the replies to forwarded requests
            let id = msg.header.id;
            let msg = Arc::new(msg);
            msg.bind_session(self);
            self.matcher.on_recv_reply(id, Some(msg), delay_ms);
        }

        true
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.clear_send_queue(false);

        let state = self.state.lock();
        debug_assert!(
            state.sending_msgs.is_empty(),
            "sending queue is not cleared yet"
        );
        debug_assert!(state.messages.is_empty(), "send queue is not cleared yet");
    }
}
