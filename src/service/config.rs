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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Hard cap on a single websocket frame payload.
pub const MAX_WEBSOCKET_PAYLOAD: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Read timeout applied before protocol detection and http decode, 0 disables it.
    pub conn_read_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 8080,
            max_connection: 10_000,
            conn_read_timeout_ms: 30_000,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub max_body_size: usize,
    pub max_header_size: usize,
    pub max_total_header_size: usize,
    pub max_header_count: usize,
    pub max_uri_length: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_body_size: 10 * 1024 * 1024,
            max_header_size: 8 * 1024,
            max_total_header_size: 32 * 1024,
            max_header_count: 100,
            max_uri_length: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_payload_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_payload_size: MAX_WEBSOCKET_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// 0 means two workers per cpu
    pub num_workers: usize,
    pub channel_capacity: usize,
    pub monitor_interval_secs: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            num_workers: 0,
            channel_capacity: 1024,
            monitor_interval_secs: 5,
            worker_check_timeout_ms: 200,
        }
    }
}

impl WorkerPoolConfig {
    pub fn worker_count(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get() * 2
        } else {
            self.num_workers
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub http: HttpConfig,
    pub websocket: WebSocketConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl ServerConfig {
    /// Load the config file, let `NOVA__SECTION__KEY` environment variables override it,
    /// and validate the result.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("NOVA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.port == 0 {
            return Err(AppError::InvalidConfig(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        let positive = [
            ("network.max_connection", self.network.max_connection),
            ("http.max_body_size", self.http.max_body_size),
            ("http.max_header_size", self.http.max_header_size),
            ("http.max_total_header_size", self.http.max_total_header_size),
            ("http.max_header_count", self.http.max_header_count),
            ("http.max_uri_length", self.http.max_uri_length),
            ("websocket.max_payload_size", self.websocket.max_payload_size),
            ("worker_pool.channel_capacity", self.worker_pool.channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.websocket.max_payload_size > MAX_WEBSOCKET_PAYLOAD {
            return Err(AppError::InvalidConfig(format!(
                "websocket.max_payload_size {} exceeds the {} byte cap",
                self.websocket.max_payload_size, MAX_WEBSOCKET_PAYLOAD
            )));
        }
        if self.http.max_header_size > self.http.max_total_header_size {
            return Err(AppError::InvalidConfig(
                "http.max_header_size must not exceed http.max_total_header_size".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.network.conn_read_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.network.shutdown_timeout_secs)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.max_header_count, 100);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = ServerConfig::default();
        config.network.port = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = ServerConfig::default();
        config.http.max_body_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http.max_body_size"));
    }

    #[test]
    fn websocket_payload_is_capped() {
        let mut config = ServerConfig::default();
        config.websocket.max_payload_size = MAX_WEBSOCKET_PAYLOAD + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_disables_reads_deadline() {
        let mut config = ServerConfig::default();
        config.network.conn_read_timeout_ms = 0;
        assert_eq!(config.read_timeout(), None);
    }
}
