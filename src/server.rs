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
//! # CalloutServer Module
//!
//! This module provides the server infrastructure for running Envoy external processors.
//! It handles the setup and management of gRPC servers (both secure and plaintext) and
//! a health check HTTP server.
//!
//! ## Overview
//!
//! The `CalloutServer` is responsible for:
//!
//! - Running a plaintext gRPC server (enabled by default)
//! - Optionally providing a secure TLS gRPC server when enabled via `enable_tls`
//! - Serving `grpc.health.v1.Health` next to the ext_proc service on each gRPC listener
//! - Running a simple HTTP health check endpoint
//! - Draining in-flight streams for a grace period after SIGINT or SIGTERM
//!
//! This infrastructure allows external processors to focus on implementing their
//! processing logic without worrying about server setup and management.

use crate::config::ServerConfig;
use crate::health::HealthService;
use crate::options::ProcessingOptions;
use crate::processor::Processor;
use crate::service::ExtProcService;
use hyper::{Body, Response, Server as HyperServer};
use log::{error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("Health check server error: {0}")]
    Http(#[from] hyper::Error),
    #[error("No listener is enabled")]
    NothingToServe,
    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Server for hosting Envoy external processors.
///
/// The `CalloutServer` manages three separate servers:
/// 1. An optional secure gRPC server with TLS
/// 2. A plaintext gRPC server for in-mesh traffic
/// 3. A simple HTTP health check endpoint
///
/// Each server runs in its own task and stops when the shutdown channel
/// flips to `true`.
#[derive(Clone)]
pub struct CalloutServer {
    config: ServerConfig,
}

/// Resolves once `shutdown` is set or its sender is gone.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn bind(address: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })
}

/// A cancelled listener task counts as a clean stop.
fn listener_result(joined: Result<Result<(), ServerError>, JoinError>) -> Result<(), ServerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

impl CalloutServer {
    /// Creates a new `CalloutServer` with the specified configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the server
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Creates a new `CalloutServer` with default configuration.
    pub fn with_default_config() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Spawns the secure gRPC server in a new task.
    ///
    /// # Arguments
    ///
    /// * `processor` - The external processor implementation to host
    /// * `options` - Processing switches for every stream
    /// * `shutdown` - Flips to `true` when the server should drain
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task
    pub fn spawn_grpc<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let task = self.grpc_task(processor, options, shutdown);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Failed to start secure server: {}", e);
            }
        })
    }

    /// Spawns the plaintext gRPC server in a new task.
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task
    pub fn spawn_plaintext_grpc<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let task = self.plaintext_grpc_task(processor, options, shutdown);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Failed to start plaintext server: {}", e);
            }
        })
    }

    /// Spawns the health check HTTP server in a new task.
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task
    pub fn spawn_health_check(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let task = self.health_check_task(shutdown);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Failed to start health check server: {}", e);
            }
        })
    }

    /// Runs every enabled listener until SIGINT or SIGTERM.
    pub async fn run<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
    ) -> Result<(), ServerError> {
        self.run_until(processor, options, shutdown_signal()).await
    }

    /// Runs every enabled listener until `signal` resolves or one of them
    /// stops, then gives in-flight streams the configured grace period.
    ///
    /// Returns the first listener error, such as an address already in use.
    pub async fn run_until<P, F>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        signal: F,
    ) -> Result<(), ServerError>
    where
        P: Processor,
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: JoinSet<Result<(), ServerError>> = JoinSet::new();

        if self.config.enable_plaintext_server {
            tasks.spawn(self.plaintext_grpc_task(
                processor.clone(),
                options.clone(),
                shutdown_rx.clone(),
            ));
        }
        if self.config.enable_tls {
            tasks.spawn(self.grpc_task(processor.clone(), options.clone(), shutdown_rx.clone()));
        }
        if self.config.health_check_address.is_some() {
            tasks.spawn(self.health_check_task(shutdown_rx.clone()));
        }
        if tasks.is_empty() {
            return Err(ServerError::NothingToServe);
        }

        let mut failure = None;
        tokio::select! {
            _ = signal => {}
            Some(joined) = tasks.join_next() => match listener_result(joined) {
                Ok(()) => warn!("A listener stopped unexpectedly"),
                Err(e) => {
                    error!("Listener failed: {}", e);
                    failure = Some(e);
                }
            },
        }

        let grace = self.config.shutdown_grace_period();
        info!("Shutting down, draining streams for {:?}", grace);
        let _ = shutdown_tx.send(true);

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = listener_result(joined) {
                    error!("Listener failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed, closing remaining streams");
            tasks.abort_all();
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Serves the ext_proc and gRPC health services on an already bound
    /// listener, without TLS.
    pub async fn serve_grpc_listener<P, F>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        listener: TcpListener,
        signal: F,
    ) -> Result<(), ServerError>
    where
        P: Processor,
        F: Future<Output = ()>,
    {
        self.serve_grpc(processor, options, listener, None, signal)
            .await
    }

    /// Serves the HTTP health check on an already bound listener. Every
    /// request gets an empty `200 OK`.
    pub async fn serve_health_listener<F>(
        &self,
        listener: TcpListener,
        signal: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let make_service = hyper::service::make_service_fn(|_| async {
            Ok::<_, Infallible>(hyper::service::service_fn(|_| async {
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }))
        });

        let incoming = hyper::server::accept::from_stream(TcpListenerStream::new(listener));
        HyperServer::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(signal)
            .await?;
        Ok(())
    }

    async fn serve_grpc<P, F>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        listener: TcpListener,
        identity: Option<Identity>,
        signal: F,
    ) -> Result<(), ServerError>
    where
        P: Processor,
        F: Future<Output = ()>,
    {
        let mut builder = Server::builder();
        if let Some(identity) = identity {
            builder = builder.tls_config(ServerTlsConfig::new().identity(identity))?;
        }

        builder
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .add_service(HealthService.into_server())
            .add_service(ExtProcService::with_options(processor, options).into_server())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;
        Ok(())
    }

    fn grpc_task<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<(), ServerError>> + Send + 'static {
        let server = self.clone();
        async move { server.start_grpc(processor, options, shutdown).await }
    }

    fn plaintext_grpc_task<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<(), ServerError>> + Send + 'static {
        let server = self.clone();
        async move {
            server
                .start_plaintext_grpc(processor, options, shutdown)
                .await
        }
    }

    fn health_check_task(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<(), ServerError>> + Send + 'static {
        let server = self.clone();
        async move { server.start_health_check(shutdown).await }
    }

    /// Loads the TLS identity and serves on `address`.
    async fn start_grpc<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        info!("Loading TLS certificates...");
        let cert = tokio::fs::read(&self.config.cert_file).await.map_err(|e| {
            ServerError::Tls(format!(
                "cannot read certificate file {:?}: {}",
                self.config.cert_file, e
            ))
        })?;
        let key = tokio::fs::read(&self.config.key_file).await.map_err(|e| {
            ServerError::Tls(format!(
                "cannot read key file {:?}: {}",
                self.config.key_file, e
            ))
        })?;
        let identity = Identity::from_pem(cert, key);

        let listener = bind(&self.config.address).await?;
        info!("Starting secure gRPC server on {}", self.config.address);
        self.serve_grpc(
            processor,
            options,
            listener,
            Some(identity),
            wait_for_shutdown(shutdown),
        )
        .await
    }

    async fn start_plaintext_grpc<P: Processor>(
        &self,
        processor: Arc<P>,
        options: ProcessingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let address = self
            .config
            .plaintext_address
            .as_ref()
            .ok_or_else(|| ServerError::Config("plaintext address not configured".to_string()))?;
        let listener = bind(address).await?;

        info!("Starting plaintext gRPC server on {}", address);
        self.serve_grpc(processor, options, listener, None, wait_for_shutdown(shutdown))
            .await
    }

    async fn start_health_check(&self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let Some(address) = &self.config.health_check_address else {
            info!("Health check server is disabled");
            return Ok(());
        };
        let listener = bind(address).await?;
        info!("Starting health check server on {}", address);
        self.serve_health_listener(listener, wait_for_shutdown(shutdown))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::noop::NoopProcessor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_nothing_to_serve() {
        let server = CalloutServer::new(ServerConfig {
            enable_plaintext_server: false,
            enable_tls: false,
            health_check_address: None,
            ..Default::default()
        });
        let result = server
            .run_until(
                Arc::new(NoopProcessor),
                ProcessingOptions::default(),
                async {},
            )
            .await;
        assert!(matches!(result, Err(ServerError::NothingToServe)));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let server = CalloutServer::new(ServerConfig {
            plaintext_address: Some("127.0.0.1:0".to_string()),
            health_check_address: Some("127.0.0.1:0".to_string()),
            shutdown_grace_period_ms: 100,
            ..Default::default()
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run_until(
                Arc::new(NoopProcessor),
                ProcessingOptions::default(),
                tokio::time::sleep(Duration::from_millis(50)),
            ),
        )
        .await
        .expect("server did not stop");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_until_reports_address_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = occupied.local_addr().unwrap().to_string();
        let server = CalloutServer::new(ServerConfig {
            plaintext_address: Some(address.clone()),
            health_check_address: None,
            shutdown_grace_period_ms: 100,
            ..Default::default()
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run_until(
                Arc::new(NoopProcessor),
                ProcessingOptions::default(),
                std::future::pending::<()>(),
            ),
        )
        .await
        .expect("server did not stop");
        match result {
            Err(ServerError::Bind { address: failed, .. }) => assert_eq!(failed, address),
            other => panic!("Expected a bind error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .unwrap();
    }
}
