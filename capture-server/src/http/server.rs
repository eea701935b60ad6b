use super::AppState;
use anyhow::{Context, Result};
use common::shutdown_signal;
use std::net::SocketAddr;
use tracing::info;

pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// 运行HTTP服务器，直到收到 Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;

        info!("✓ HTTP server listening on {}", self.addr);

        let shutdown = self.state.shutdown.clone();
        let app = super::create_router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => info!("Shutdown signal received"),
                    _ = shutdown.cancelled() => {}
                }
                // 所有进行中的流随之结束
                shutdown.cancel();
            })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
