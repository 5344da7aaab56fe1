// Copyright 2025 Google LLC
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
use crate::server::ServerError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listener and lifecycle settings for the `CalloutServer`.
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the TLS gRPC server (format: "host:port")
    pub address: String,

    /// Address for the plaintext gRPC server (format: "host:port")
    pub plaintext_address: Option<String>,

    /// Address for the HTTP health check server; `None` disables it
    pub health_check_address: Option<String>,

    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    pub enable_plaintext_server: bool,
    pub enable_tls: bool,

    /// HTTP/2 stream limit per connection
    pub max_concurrent_streams: u32,

    /// How long in-flight streams may drain after a shutdown signal
    pub shutdown_grace_period_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:443".to_string(),
            plaintext_address: Some("0.0.0.0:50051".to_string()),
            health_check_address: Some("0.0.0.0:8000".to_string()),
            cert_file: PathBuf::from("extproc/ssl_creds/localhost.crt"),
            key_file: PathBuf::from("extproc/ssl_creds/localhost.key"),
            enable_plaintext_server: true,
            enable_tls: false,
            max_concurrent_streams: 1000,
            shutdown_grace_period_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        serde_json::from_str(json).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Moves the plaintext listener to `port`, keeping its host.
    pub fn with_plaintext_port(mut self, port: u16) -> Self {
        let host = self
            .plaintext_address
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':'))
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.plaintext_address = Some(format!("{}:{}", host, port));
        self
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}
