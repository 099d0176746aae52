//! Usage: Listener lifecycle: build the relay from config, serve, shut down gracefully.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::routes::build_router;
use super::{GatewayAppState, GatewayStatus};
use crate::config::{ConfigError, GatewayConfig};
use crate::providers::ProviderRegistry;
use crate::request_logs::{self, OutcomeSink, DEFAULT_OUTCOME_BUFFER_CAPACITY};
use crate::router::ModelRouter;

const OUTCOME_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum GatewayStartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

struct RunningGateway {
    port: u16,
    base_url: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    outcome_task: JoinHandle<()>,
}

#[derive(Default)]
pub struct GatewayManager {
    running: Option<RunningGateway>,
}

fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, GatewayStartError> {
    let bind_err = |source| GatewayStartError::Bind { addr, source };
    let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    Ok(listener)
}

impl GatewayManager {
    pub fn status(&self) -> GatewayStatus {
        match &self.running {
            Some(r) => GatewayStatus {
                running: true,
                port: Some(r.port),
                base_url: Some(r.base_url.clone()),
            },
            None => GatewayStatus {
                running: false,
                port: None,
                base_url: None,
            },
        }
    }

    /// Validates `config`, binds `addr` (port 0 picks a free port) and starts serving.
    /// Must be called inside a tokio runtime.
    pub fn start(
        &mut self,
        config: &GatewayConfig,
        addr: SocketAddr,
        sink: Arc<dyn OutcomeSink>,
    ) -> Result<GatewayStatus, GatewayStartError> {
        if self.running.is_some() {
            return Ok(self.status());
        }

        config.validate()?;

        let http = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        let registry = Arc::new(ProviderRegistry::from_config(config, http));
        let router = Arc::new(ModelRouter::from_config(config, registry)?);

        let std_listener = bind_listener(addr)?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| GatewayStartError::Bind { addr, source })?;
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|source| GatewayStartError::Bind { addr, source })?;

        let (outcomes, outcome_task) =
            request_logs::start_buffered_writer(sink, DEFAULT_OUTCOME_BUFFER_CAPACITY);
        let app = build_router(GatewayAppState::new(router, outcomes));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(addr = %local_addr, error = %err, "gateway server error");
            }
        });

        let base_url = format!("http://{local_addr}");
        tracing::info!(base_url = %base_url, routes = config.routes.len(), "gateway listening");

        self.running = Some(RunningGateway {
            port: local_addr.port(),
            base_url,
            shutdown: shutdown_tx,
            task,
            outcome_task,
        });
        Ok(self.status())
    }

    /// Stops accepting, waits for in-flight requests, then drains pending outcomes.
    pub async fn stop(&mut self) -> GatewayStatus {
        let Some(running) = self.running.take() else {
            return self.status();
        };

        let _ = running.shutdown.send(());
        if let Err(err) = running.task.await {
            tracing::error!(error = %err, "gateway task join failed");
        }
        if tokio::time::timeout(OUTCOME_DRAIN_TIMEOUT, running.outcome_task)
            .await
            .is_err()
        {
            tracing::warn!("outcome writer did not drain before shutdown timeout");
        }
        tracing::info!(base_url = %running.base_url, "gateway stopped");
        self.status()
    }
}
