use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use time::OffsetDateTime;
use tokenbroker_auth::{BrokerState, CredentialService, RotationLedger, broker_routes};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;

pub struct BrokerServer {
    addr: SocketAddr,
    app: Router,
    service: Arc<CredentialService>,
    cleanup_interval: Duration,
}

pub fn build_app(cfg: &AppConfig, service: Arc<CredentialService>) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let max_concurrent = cfg.server.max_concurrent_requests.max(1);
    broker_routes(BrokerState::new(service))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
}

/// Periodically removes expired entries from the rotation ledger until
/// `cancel` fires.
pub fn spawn_ledger_cleanup(
    ledger: Arc<dyn RotationLedger>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("ledger cleanup stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match ledger.cleanup_expired(OffsetDateTime::now_utc()).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "removed expired ledger entries"),
                        Err(e) => tracing::warn!(error = %e, "ledger cleanup failed"),
                    }
                }
            }
        }
    })
}

#[derive(Default)]
pub struct ServerBuilder {
    addr: Option<SocketAddr>,
    config: AppConfig,
    service: Option<Arc<CredentialService>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Uses a prebuilt credential service instead of one derived from the
    /// configuration.
    pub fn with_service(mut self, service: Arc<CredentialService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn build(self) -> anyhow::Result<BrokerServer> {
        let service = match self.service {
            Some(service) => service,
            None => Arc::new(CredentialService::from_config(&self.config.auth)?),
        };
        let app = build_app(&self.config, Arc::clone(&service));

        Ok(BrokerServer {
            addr: self.addr.unwrap_or_else(|| self.config.addr()),
            app,
            service,
            cleanup_interval: self.config.auth.ledger.cleanup_interval,
        })
    }
}

impl BrokerServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `shutdown` completes.
    pub async fn serve<F>(self, listener: tokio::net::TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let cleanup = spawn_ledger_cleanup(
            Arc::clone(self.service.ledger()),
            self.cleanup_interval,
            cancel.clone(),
        );

        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await;

        cancel.cancel();
        let _ = cleanup.await;
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
