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

//! Network Module Implementation
//!
//! This module is the connection-oriented transport core of the RPC runtime:
//! it multiplexes logical RPC messages over long-lived per-peer sessions and
//! mediates between the RPC engine above and byte-oriented transports below.
//!
//! # Architecture
//!
//! - `RpcSession`: one bidirectional pipeline per peer, with a batched send
//!   queue keeping at most one write in flight, plus the connect state
//!   machine and the parser-driven inbound framing loop
//! - `ConnectionOrientedNetwork`: two address-indexed registries (client and
//!   server sessions) plus outbound routing and lifecycle callbacks
//! - `Network`: the shared provider base holding the engine back-reference,
//!   buffer sizing, parser dispatch and local address resolution
//! - `MessageParser` / `StoneParser`: pluggable framing, resolved per
//!   session from the leading wire magic
//! - `TcpSessionTransport` / `TcpServer`: the tokio-based transport provider
//!
//! # Failure semantics
//!
//! A transport failure moves the session to Disconnected, drains its queues,
//! and fails every unreplied, non-forwarded request with a synthesized empty
//! reply so callers never wait out a timeout on a dead connection.

mod connection;
mod frame;
mod join_point;
mod net;
mod parser;
mod reader;
mod session;
mod tcp;
mod transport;

pub use connection::ConnectionOrientedNetwork;
pub use frame::StoneParser;
pub use join_point::{JoinPoint, ON_RPC_SESSION_CONNECTED, ON_RPC_SESSION_DISCONNECTED};
pub use net::{local_ipv4, Network, NetworkOptions};
pub use parser::{
    create_message_parser, get_header_type, register_message_parser, HeaderFormat, MessageParser,
    ParserFactory, ParserStatus, HEADER_TYPE_LEN,
};
pub use reader::MessageReader;
pub use session::{ConnectState, RpcSession, READ_NEXT_DEFAULT};
pub use tcp::{TcpServer, TcpSessionTransport, TcpTransportProvider};
pub use transport::{ReplyMatcher, RpcEngine, SessionTransport, TransportProvider};
