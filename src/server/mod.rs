//! Issuance server — listener setup, TLS termination, graceful shutdown.
//!
//! Requests are handled in parallel and independently; nothing here imposes
//! request-to-request ordering. When `server_cert_path` / `server_key_path`
//! are configured, TLS is terminated in-process; otherwise the server speaks
//! plaintext and expects a TLS-terminating proxy in front. An optional
//! second plain-HTTP listener exposes only the host-certificate bridge.

pub mod handler;
pub mod tls;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::issuer::CertIssuer;
use crate::{Error, Result};

pub use handler::{
    AppState, IssueCertResponse, IssueHostCertRequest, IssueUserCertRequest,
};

/// The issuance server.
pub struct CertServer {
    config: Config,
    issuer: CertIssuer,
}

impl CertServer {
    /// Build the server: loads the CA key and assembles the pipeline.
    pub fn new(config: Config) -> Result<Self> {
        let issuer = CertIssuer::from_config(&config)?;
        Ok(Self { config, issuer })
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let host: IpAddr = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
        let addr = SocketAddr::new(host, self.config.server.listen_port);

        let state = Arc::new(AppState {
            minter: Arc::clone(&self.issuer.minter),
            ca_public_key: self.issuer.ca_public_key.clone(),
        });
        let app = handler::router(Arc::clone(&state));

        let (shutdown_tx, _) = broadcast::channel(1);

        // Optional plain-HTTP host-certificate bridge.
        if let Some(http_port) = self.config.server.http_listen_port {
            let bridge = handler::bridge_router(Arc::clone(&state));
            let bridge_addr = SocketAddr::new(host, http_port);
            let listener = TcpListener::bind(bridge_addr).await?;
            info!(addr = %bridge_addr, "Host-certificate bridge listening (plain HTTP)");

            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let result = axum::serve(listener, bridge)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                    })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "Host-certificate bridge exited with error");
                }
            });
        }

        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %addr,
            version = env!("CARGO_PKG_VERSION"),
            "shortcert issuance server listening"
        );

        match (
            self.config.server.server_cert_path.as_deref(),
            self.config.server.server_key_path.as_deref(),
        ) {
            (Some(cert_path), Some(key_path)) => {
                let tls_cfg = Arc::new(tls::build_tls_config(cert_path, key_path)?);
                serve_tls(listener, app, tls_cfg, shutdown_signal(shutdown_tx)).await
            }
            _ => {
                warn!("TLS not configured; serving plaintext behind a terminating proxy");
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))
            }
        }
    }
}

/// Accept loop terminating TLS in-process.
///
/// Each accepted connection is served on its own task; connections in flight
/// when shutdown fires finish on their own.
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls_cfg: Arc<rustls::ServerConfig>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_cfg);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutting down TLS listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(app.clone());
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let result = ConnBuilder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                                .await;
                            if let Err(e) = result {
                                debug!(peer = %peer, error = %e, "Connection error");
                            }
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives, then fans the shutdown out to
/// the secondary listeners.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
