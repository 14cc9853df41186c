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

extern crate config as rs_config;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::AppError::InvalidValue;
use crate::AppResult;

pub static GLOBAL_CONFIG: OnceCell<NodeConfig> = OnceCell::new();

pub fn global_config() -> &'static NodeConfig {
    GLOBAL_CONFIG
        .get()
        .expect("global config is not initialized")
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub id: i32,
}

/// Network section of the node configuration.
///
/// `ip` may be left empty, in which case the primary IPv4 address is resolved
/// through `explicit_host_address`, then `primary_interface`, then the first
/// non-loopback `eth*` interface (see `network::local_ipv4`).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// send queue size above which throttling is applied (advisory)
    pub send_queue_threshold: u64,
    /// format assumed for inbound bytes whose leading magic is unrecognized
    pub unknown_message_header_format: String,
    /// explicit host name or ip (v4) assigned to this node (e.g., service ip
    /// for pods in kubernetes)
    pub explicit_host_address: String,
    /// network interface name used to init the primary ipv4 address; if
    /// empty, the first "eth" prefixed non-loopback ipv4 address is used
    pub primary_interface: String,
    pub message_buffer_block_size: usize,
    pub max_buffer_block_count_per_send: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: String::new(),
            port: 8800,
            max_connection: 1024,
            send_queue_threshold: 4 * 1024,
            unknown_message_header_format: "NET_HDR_INVALID".to_string(),
            explicit_host_address: String::new(),
            primary_interface: String::new(),
            message_buffer_block_size: 1024 * 64,
            max_buffer_block_count_per_send: 64,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
}

impl NodeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(InvalidValue("config file path is not utf-8".to_string()))?;
        let config = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        Ok(node_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_network_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.send_queue_threshold, 4096);
        assert_eq!(config.unknown_message_header_format, "NET_HDR_INVALID");
        assert_eq!(config.message_buffer_block_size, 64 * 1024);
        assert_eq!(config.max_buffer_block_count_per_send, 64);
        assert!(config.explicit_host_address.is_empty());
        assert!(config.primary_interface.is_empty());
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() -> AppResult<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "[network]\nip = \"127.0.0.1\"\nport = 9901\nsend_queue_threshold = 128"
        )?;

        let config = NodeConfig::set_up_config(file.path())?;
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.network.port, 9901);
        assert_eq!(config.network.send_queue_threshold, 128);
        // untouched keys fall back to their defaults
        assert_eq!(config.network.unknown_message_header_format, "NET_HDR_INVALID");
        assert_eq!(config.network.max_buffer_block_count_per_send, 64);
        Ok(())
    }
}
