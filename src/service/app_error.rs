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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    Tracing(#[from] tracing::dispatcher::SetGlobalDefaultError),

    /// transport errors
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("self connection detected, address = {0}")]
    SelfConnection(SocketAddr),

    #[error("network error: {0}")]
    NetworkError(String),

    /// marker error: more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,
}
