//! REST server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use extman_controller::ExtensionController;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::ConnectorProvider;
use crate::routes::{build_router, GatewayState, API_BASE_PATH};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Deadline applied to every operation; `None` disables it.
    pub request_timeout: Option<Duration>,
}

/// Configured, not yet listening, REST server.
pub struct RestServer {
    config: GatewayConfig,
    state: Arc<GatewayState>,
}

impl RestServer {
    pub fn new(
        controller: ExtensionController,
        connectors: Arc<dyn ConnectorProvider>,
        config: GatewayConfig,
    ) -> Self {
        let state = Arc::new(GatewayState::new(
            controller,
            connectors,
            config.request_timeout,
        ));
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    /// Binds the listener and serves in a background task.
    pub async fn start(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(self.config.bind)
            .await
            .with_context(|| format!("failed to bind rest server on {}", self.config.bind))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve bound rest server address")?;
        let app = self.router();
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_signal.await;
                })
                .await
        });
        tracing::info!(address = %local_addr, base_path = API_BASE_PATH, "rest server listening");
        Ok(RunningServer {
            local_addr,
            shutdown,
            task,
        })
    }
}

/// Handle of a listening server; `stop` consumes it.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .context("rest server task failed")?
            .context("rest server exited unexpectedly")?;
        tracing::info!(address = %self.local_addr, "rest server stopped");
        Ok(())
    }
}
