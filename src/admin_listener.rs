//! Admin listener for health checks and metrics.

use crate::admin::AdminService;
use crate::error::{ProxyError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{error, info, warn};

/// Admin HTTP listener for health and metrics endpoints.
///
/// Serves admin endpoints on a separate port for monitoring and
/// observability.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds to the specified address for admin endpoints.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    pub async fn bind(addr: &str) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin listener bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            admin_service: AdminService::new(),
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin requests until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single admin connection using HTTP/1.1.
    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0").await;
        assert!(listener.is_ok());
    }
}
