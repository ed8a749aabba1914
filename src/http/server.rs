//! HTTP server for the admission check service.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::Result;
use crate::ratelimit::Limiters;

/// HTTP server for the admission check service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiters shared by every request
    limiters: Arc<Limiters>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiters: Arc<Limiters>) -> Self {
        Self { addr, limiters }
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// In-flight requests are drained once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP admission service");

        axum::serve(listener, router(self.limiters))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let limiters = Arc::new(Limiters::from_config(&TollgateConfig::default()).unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, limiters);

        server.serve_with_shutdown(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_io_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let limiters = Arc::new(Limiters::from_config(&TollgateConfig::default()).unwrap());

        let err = HttpServer::new(addr, limiters).serve().await.unwrap_err();
        assert!(matches!(err, crate::error::TollgateError::Io(_)));
    }
}
