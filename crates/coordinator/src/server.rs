//! gRPC server with graceful shutdown
//!
//! Binds the coordinator service either to a configured address or to a
//! listener the caller already owns (tests bind port 0 and read it back).

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::proto::coordinator_server::CoordinatorServer as CoordinatorGrpcServer;
use crate::service::{CoordinatorService, MAX_MESSAGE_BYTES};

type ServerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Coordinator server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,

    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,

    /// How often the server checks for members that stopped heartbeating
    pub monitor_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            tcp_keepalive: Some(Duration::from_secs(60)),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Coordinator gRPC server
pub struct CoordinatorServer {
    config: ServerConfig,
    service: CoordinatorService,
}

impl CoordinatorServer {
    pub fn new(service: CoordinatorService) -> Self {
        Self {
            config: ServerConfig::default(),
            service,
        }
    }

    pub fn with_config(service: CoordinatorService, config: ServerConfig) -> Self {
        Self { config, service }
    }

    /// Run on the configured address until Ctrl+C or SIGTERM
    pub async fn run(self) -> ServerResult {
        let listener = TcpListener::bind(self.config.addr).await?;
        self.run_with_listener(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown: F) -> ServerResult
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        let monitor = self.service.spawn_monitor(self.config.monitor_interval);
        let stats = self.service.clone();

        // Gathered payloads grow with the world size, so the limits are generous
        let grpc_service = CoordinatorGrpcServer::new(self.service)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);

        // No request timeout: exchanges are bounded by the collective timeout
        let mut server_builder = Server::builder();
        if let Some(keepalive) = self.config.tcp_keepalive {
            server_builder = server_builder.tcp_keepalive(Some(keepalive));
        }

        info!(address = %addr, "Coordinator server listening");

        let result = server_builder
            .add_service(grpc_service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await;
        monitor.abort();

        result.map_err(|e| {
            error!(error = %e, "Server error");
            Box::new(e) as Box<dyn std::error::Error + Send + Sync>
        })?;

        for (method, summary) in stats.metrics().summary() {
            info!(
                method = %method,
                requests = summary.requests,
                errors = summary.errors,
                p99_latency_us = ?summary.p99_latency_us,
                "Request summary"
            );
        }
        info!(
            uptime_secs = stats.uptime().as_secs(),
            "Coordinator server shutdown complete"
        );
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
