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

use std::io::ErrorKind;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// configuration errors, fatal at startup
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("duplicate plugin id: {0}")]
    DuplicatePlugin(String),

    #[error("plugin {plugin} depends on unregistered plugin {dependency}")]
    MissingDependency { plugin: String, dependency: String },

    #[error("circular dependency detected at plugin {0}")]
    CircularDependency(String),

    #[error("plugin {plugin} failed to initialize: {reason}")]
    PluginInit { plugin: String, reason: String },

    #[error("plugin {plugin} failed to start: {reason}")]
    PluginStart { plugin: String, reason: String },

    #[error("cannot register {0} after the server has started")]
    RegistrationClosed(String),

    /// decode errors, scoped to one connection
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("websocket protocol error: {0}")]
    WebSocketProtocol(String),

    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    /// resource exhaustion, callers answer with a specific status
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("header too large: {0}")]
    HeaderTooLarge(String),

    #[error("uri too long: {0}")]
    UriTooLong(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    /// handler errors
    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("response already sent")]
    ResponseAlreadySent,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// io errors
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    /// marker error, the read buffer needs more bytes
    #[error("incomplete")]
    Incomplete,
}

impl AppError {
    /// Body, header or payload limits exceeded, or no admission slot left.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            AppError::PayloadTooLarge(_)
                | AppError::HeaderTooLarge(_)
                | AppError::UriTooLong(_)
                | AppError::PoolExhausted
        )
    }

    /// I/O failures that happen under normal operation: peers hanging up, idle sockets
    /// timing out. These are logged at debug level.
    pub fn is_expected_io(&self) -> bool {
        match self {
            AppError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
                    | ErrorKind::NotConnected
            ),
            AppError::Timeout(_) | AppError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// The status to answer with when the error surfaces while a response can still be written.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::PayloadTooLarge(_) => 413,
            AppError::HeaderTooLarge(_) => 431,
            AppError::UriTooLong(_) => 414,
            AppError::MalformedRequest(_) | AppError::HandshakeFailed(_) => 400,
            AppError::PoolExhausted => 503,
            _ => 500,
        }
    }
}
