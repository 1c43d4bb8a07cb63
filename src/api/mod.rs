// HTTP transport: JSON operation routes plus the Server-Sent Events feed

pub mod routes;
pub mod sse;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::sessions::service::SessionService;

pub use routes::{handle, ApiBody, ApiError, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
pub use sse::{encode_event, event_stream, SseDecoder};

/// Bound HTTP listener serving one `SessionService`
pub struct ApiServer {
    listener: TcpListener,
    service: Arc<SessionService>,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr, service: Arc<SessionService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self { listener, service })
    }

    /// Actual address, useful when bound to port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("API listening on http://{}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let service = self.service.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req| routes::handle(req, service.clone()));
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("API server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
