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

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::network::parser::{create_message_parser, HeaderFormat, MessageParser};
use crate::network::RpcEngine;
use crate::service::global_config;
use crate::utils::Scheduler;
use crate::{AppError, AppResult};

/// Resolved knobs the network runs with. `from_global_config` is the
/// file-driven path; `Default` keeps the crate embeddable without a global
/// config (tests, tools).
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// the address peers reach this node at; stamped as `to_address` on
    /// every inbound message
    pub address: SocketAddr,
    pub client_hdr_format: HeaderFormat,
    /// fallback format for inbound streams whose leading magic is unknown
    pub unknown_msg_hdr_format: HeaderFormat,
    pub message_buffer_block_size: usize,
    pub max_buffer_block_count_per_send: usize,
    /// send queue size above which throttling is applied (advisory, exposed
    /// to the engine, never enforced here)
    pub send_queue_threshold: u64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8800),
            client_hdr_format: HeaderFormat::STONE,
            unknown_msg_hdr_format: HeaderFormat::INVALID,
            message_buffer_block_size: 1024 * 64,
            max_buffer_block_count_per_send: 64,
            send_queue_threshold: 4 * 1024,
        }
    }
}

impl NetworkOptions {
    /// Builds options from the process-wide config, resolving the primary
    /// IPv4 address when `network.ip` is not set explicitly.
    pub fn from_global_config() -> AppResult<NetworkOptions> {
        let network = &global_config().network;
        let ip = if network.ip.is_empty() {
            IpAddr::V4(local_ipv4(
                &network.explicit_host_address,
                &network.primary_interface,
            )?)
        } else {
            network
                .ip
                .parse()
                .map_err(|_| AppError::InvalidValue(format!("network.ip = {}", network.ip)))?
        };

        Ok(NetworkOptions {
            address: SocketAddr::new(ip, network.port),
            client_hdr_format: HeaderFormat::STONE,
            unknown_msg_hdr_format: HeaderFormat::from_name(
                &network.unknown_message_header_format,
            ),
            message_buffer_block_size: network.message_buffer_block_size,
            max_buffer_block_count_per_send: network.max_buffer_block_count_per_send,
            send_queue_threshold: network.send_queue_threshold,
        })
    }
}

struct ParserAttr {
    client_hdr_format: HeaderFormat,
    message_buffer_block_size: usize,
}

/// Shared base of every network provider: the engine back-reference, buffer
/// sizing, parser dispatch and the deferred-task scheduler.
pub struct Network {
    engine: Arc<dyn RpcEngine>,
    address: SocketAddr,
    parser_attr: RwLock<ParserAttr>,
    max_buffer_block_count_per_send: usize,
    send_queue_threshold: u64,
    unknown_msg_hdr_format: HeaderFormat,
    scheduler: Arc<dyn Scheduler>,
}

impl Network {
    pub fn new(
        engine: Arc<dyn RpcEngine>,
        options: NetworkOptions,
        scheduler: Arc<dyn Scheduler>,
    ) -> Network {
        Network {
            engine,
            address: options.address,
            parser_attr: RwLock::new(ParserAttr {
                client_hdr_format: options.client_hdr_format,
                message_buffer_block_size: options.message_buffer_block_size,
            }),
            max_buffer_block_count_per_send: options.max_buffer_block_count_per_send,
            send_queue_threshold: options.send_queue_threshold,
            unknown_msg_hdr_format: options.unknown_msg_hdr_format,
            scheduler,
        }
    }

    pub fn engine(&self) -> &Arc<dyn RpcEngine> {
        &self.engine
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn client_hdr_format(&self) -> HeaderFormat {
        self.parser_attr.read().client_hdr_format
    }

    pub fn message_buffer_block_size(&self) -> usize {
        self.parser_attr.read().message_buffer_block_size
    }

    pub fn max_buffer_block_count_per_send(&self) -> usize {
        self.max_buffer_block_count_per_send
    }

    pub fn send_queue_threshold(&self) -> u64 {
        self.send_queue_threshold
    }

    pub fn unknown_msg_hdr_format(&self) -> HeaderFormat {
        self.unknown_msg_hdr_format
    }

    /// Overrides the header format used for new client sessions and the
    /// reader block size (tooling hook; call before sessions exist).
    pub fn reset_parser_attr(&self, client_hdr_format: HeaderFormat, block_size: usize) {
        let mut attr = self.parser_attr.write();
        attr.client_hdr_format = client_hdr_format;
        attr.message_buffer_block_size = block_size;
    }

    /// Instantiates a parser for `format`.
    ///
    /// # Panics
    ///
    /// Panics when `format` has no registered factory; formats reach this
    /// point only through registration or explicit configuration, so a miss
    /// is a programmer error.
    pub fn new_message_parser(&self, format: HeaderFormat) -> Box<dyn MessageParser> {
        create_message_parser(format)
            .unwrap_or_else(|| panic!("message parser '{}' not registered or invalid", format))
    }
}

/// Resolves this node's primary IPv4 address by preference: the explicitly
/// configured host, then the named interface, then the first non-loopback
/// `eth*` interface, then any non-loopback interface.
pub fn local_ipv4(explicit_host: &str, interface: &str) -> AppResult<Ipv4Addr> {
    if !explicit_host.is_empty() {
        if let Some(ip) = ipv4_from_host(explicit_host) {
            return Ok(ip);
        }
        warn!(
            "explicit host address {} did not resolve to an ipv4 address",
            explicit_host
        );
    }

    let interfaces = if_addrs::get_if_addrs()?;

    if !interface.is_empty() {
        if let Some(ip) = interfaces
            .iter()
            .filter(|i| i.name == interface)
            .find_map(|i| match i.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
        {
            return Ok(ip);
        }
        warn!("interface {} has no ipv4 address", interface);
    }

    let eth_first = interfaces
        .iter()
        .filter(|i| !i.is_loopback() && i.name.starts_with("eth"))
        .chain(interfaces.iter().filter(|i| !i.is_loopback()))
        .find_map(|i| match i.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });

    eth_first.ok_or_else(|| {
        AppError::NetworkError("no usable ipv4 address found on this host".to_string())
    })
}

fn ipv4_from_host(host: &str) -> Option<Ipv4Addr> {
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_host_wins() {
        assert_eq!(
            local_ipv4("127.0.0.1", "").unwrap(),
            Ipv4Addr::new(127, 0, 0, 1)
        );
    }

    #[test]
    fn test_options_defaults_match_config_defaults() {
        let options = NetworkOptions::default();
        assert_eq!(options.message_buffer_block_size, 64 * 1024);
        assert_eq!(options.max_buffer_block_count_per_send, 64);
        assert_eq!(options.send_queue_threshold, 4096);
        assert_eq!(options.client_hdr_format, HeaderFormat::STONE);
        assert_eq!(options.unknown_msg_hdr_format, HeaderFormat::INVALID);
    }

    #[test]
    fn test_options_from_global_config() {
        let mut node_config = crate::service::NodeConfig::default();
        node_config.network.ip = "127.0.0.1".to_string();
        node_config.network.port = 9907;
        node_config.network.unknown_message_header_format = "NET_HDR_STONE".to_string();
        let _ = crate::service::GLOBAL_CONFIG.set(node_config);

        let options = NetworkOptions::from_global_config().unwrap();
        assert_eq!(options.address, "127.0.0.1:9907".parse().unwrap());
        assert_eq!(options.unknown_msg_hdr_format, HeaderFormat::STONE);
    }
}
