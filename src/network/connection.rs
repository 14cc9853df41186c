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

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::message::RpcMessage;
use crate::network::net::{Network, NetworkOptions};
use crate::network::parser::{HeaderFormat, MessageParser};
use crate::network::{RpcEngine, RpcSession, SessionTransport, TransportProvider};
use crate::utils::Scheduler;

/// Connection-oriented network provider.
///
/// Keeps two address-indexed session registries: `clients` for sessions this
/// process initiated and `servers` for sessions accepted from peers. Both are
/// read-heavy; writes happen only on session create, accept and destroy.
/// Outbound messages are routed by destination address, creating (and
/// connecting) a client session on first use.
pub struct ConnectionOrientedNetwork {
    net: Network,
    provider: Arc<dyn TransportProvider>,
    clients: DashMap<SocketAddr, Arc<RpcSession>>,
    servers: DashMap<SocketAddr, Arc<RpcSession>>,
}

impl ConnectionOrientedNetwork {
    pub fn new(
        engine: Arc<dyn RpcEngine>,
        provider: Arc<dyn TransportProvider>,
        options: NetworkOptions,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<ConnectionOrientedNetwork> {
        Arc::new(ConnectionOrientedNetwork {
            net: Network::new(engine, options, scheduler),
            provider,
            clients: DashMap::new(),
            servers: DashMap::new(),
        })
    }

    // ---------------------------------------------------------------------
    // base network surface
    // ---------------------------------------------------------------------

    pub fn engine(&self) -> &Arc<dyn RpcEngine> {
        self.net.engine()
    }

    pub fn address(&self) -> SocketAddr {
        self.net.address()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.net.scheduler()
    }

    pub fn client_hdr_format(&self) -> HeaderFormat {
        self.net.client_hdr_format()
    }

    pub fn unknown_msg_hdr_format(&self) -> HeaderFormat {
        self.net.unknown_msg_hdr_format()
    }

    pub fn message_buffer_block_size(&self) -> usize {
        self.net.message_buffer_block_size()
    }

    pub fn max_buffer_block_count_per_send(&self) -> usize {
        self.net.max_buffer_block_count_per_send()
    }

    pub fn send_queue_threshold(&self) -> u64 {
        self.net.send_queue_threshold()
    }

    pub fn reset_parser_attr(&self, client_hdr_format: HeaderFormat, block_size: usize) {
        self.net.reset_parser_attr(client_hdr_format, block_size);
    }

    pub fn new_message_parser(&self, format: HeaderFormat) -> Box<dyn MessageParser> {
        self.net.new_message_parser(format)
    }

    // ---------------------------------------------------------------------
    // outbound routing
    // ---------------------------------------------------------------------

    /// Routes `request` to the session for its destination address, creating
    /// and connecting a client session when none exists. A message sent to a
    /// still-connecting session waits in its queue and is flushed once the
    /// connect completes.
    pub fn send_message(self: &Arc<Self>, request: Arc<RpcMessage>) {
        let Some(to) = request.to_address else {
            debug_assert!(false, "outbound message must carry a destination address");
            error!(
                "dropping outbound message {} without destination address",
                request.header.id
            );
            return;
        };

        let session = self.clients.get(&to).map(|entry| entry.value().clone());

        let session = match session {
            Some(session) => session,
            None => {
                let (session, new_client) = match self.clients.entry(to) {
                    Entry::Occupied(entry) => (entry.get().clone(), false),
                    Entry::Vacant(entry) => {
                        let created = self.create_client_session(to);
                        entry.insert(created.clone());
                        (created, true)
                    }
                };
                if new_client {
                    debug!(
                        "client session created, remote_server = {}, current_count = {}",
                        to,
                        self.clients.len()
                    );
                    session.connect();
                }
                session
            }
        };

        session.send_message(request);
    }

    fn create_client_session(self: &Arc<Self>, remote_addr: SocketAddr) -> Arc<RpcSession> {
        let transport = self.provider.create_client_transport(remote_addr);
        RpcSession::new_client(self.clone(), remote_addr, transport)
    }

    /// Wraps an accepted connection in a server session. The caller (the
    /// transport acceptor) registers it via `on_server_session_accepted` and
    /// then starts the read pipeline.
    pub fn create_server_session(
        self: &Arc<Self>,
        remote_addr: SocketAddr,
        transport: Arc<dyn SessionTransport>,
    ) -> Arc<RpcSession> {
        RpcSession::new_server(self.clone(), remote_addr, transport)
    }

    // ---------------------------------------------------------------------
    // registry maintenance
    // ---------------------------------------------------------------------

    pub fn get_client_session(&self, ep: SocketAddr) -> Option<Arc<RpcSession>> {
        self.clients.get(&ep).map(|entry| entry.value().clone())
    }

    pub fn get_server_session(&self, ep: SocketAddr) -> Option<Arc<RpcSession>> {
        self.servers.get(&ep).map(|entry| entry.value().clone())
    }

    /// Registers an accepted session. A colliding address preempts the prior
    /// entry: the registry always points at the newest accepted session.
    pub fn on_server_session_accepted(&self, session: &Arc<RpcSession>) {
        if let Some(prev) = self
            .servers
            .insert(session.remote_address(), session.clone())
        {
            if !Arc::ptr_eq(&prev, session) {
                warn!(
                    "server session already exists, remote_client = {}, preempted",
                    session.remote_address()
                );
            }
        }

        debug!(
            "server session accepted, remote_client = {}, current_count = {}",
            session.remote_address(),
            self.servers.len()
        );
    }

    /// Removes a disconnected server session, but only when the registry
    /// entry is still this very session; a preempting accept may already
    /// have replaced it.
    pub fn on_server_session_disconnected(&self, session: &Arc<RpcSession>) {
        let removed = self
            .servers
            .remove_if(&session.remote_address(), |_, current| {
                Arc::ptr_eq(current, session)
            })
            .is_some();

        if removed {
            debug!(
                "server session disconnected, remote_client = {}, current_count = {}",
                session.remote_address(),
                self.servers.len()
            );
        }
    }

    pub fn on_client_session_connected(&self, session: &Arc<RpcSession>) {
        let known = self
            .clients
            .get(&session.remote_address())
            .map(|entry| Arc::ptr_eq(entry.value(), session))
            .unwrap_or(false);

        if known {
            debug!(
                "client session connected, remote_server = {}, current_count = {}",
                session.remote_address(),
                self.clients.len()
            );
        }
    }

    pub fn on_client_session_disconnected(&self, session: &Arc<RpcSession>) {
        let removed = self
            .clients
            .remove_if(&session.remote_address(), |_, current| {
                Arc::ptr_eq(current, session)
            })
            .is_some();

        if removed {
            debug!(
                "client session disconnected, remote_server = {}, current_count = {}",
                session.remote_address(),
                self.clients.len()
            );
        }
    }

    // ---------------------------------------------------------------------
    // fault injection
    // ---------------------------------------------------------------------

    /// Drops `msg` by force-closing the session that carries it. Inbound
    /// messages always arrive with their session bound; on the send path the
    /// session may also be resolved from the destination address.
    pub fn inject_drop_message(&self, msg: &Arc<RpcMessage>, is_send: bool) {
        let session = msg.session().or_else(|| {
            debug_assert!(is_send, "received message should always have io_session set");
            msg.to_address
                .and_then(|to| self.clients.get(&to).map(|entry| entry.value().clone()))
        });

        if let Some(session) = session {
            session.close_on_fault_injection();
        }
    }
}
