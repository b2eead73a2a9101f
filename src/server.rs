use crate::clock::SystemClock;
use crate::config::{Config, StoreMode};
use crate::engine::QuotaEngine;
use crate::error::Result;
use crate::handlers::{
    admit_message, check_abuse, check_quota, check_rate, get_usage, health_check,
    readiness_check, AppState,
};
use crate::middleware::logging_middleware;
use crate::store::{CounterStore, FailoverStore, LocalStore, RedisStore};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the router over an already-opened engine.
pub fn create_app(engine: Arc<QuotaEngine>) -> Router {
    Router::new()
        .route("/v1/rate/check", post(check_rate))
        .route("/v1/quota/check", post(check_quota))
        .route("/v1/abuse/check", post(check_abuse))
        .route("/v1/messages/admit", post(admit_message))
        .route("/v1/usage", get(get_usage))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(AppState::new(engine))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Builds the counter store selected by `config`.
pub fn build_store(config: &Config) -> Result<Arc<dyn CounterStore>> {
    let clock = Arc::new(SystemClock);
    let local = || Arc::new(LocalStore::new(clock.clone(), config.janitor_interval()));
    let redis = |url: &str| RedisStore::new(url, config.redis_timeout());

    let store: Arc<dyn CounterStore> = match (config.effective_store_mode(), &config.redis_url) {
        (StoreMode::Memory, _) => local(),
        (StoreMode::Redis, Some(url)) => Arc::new(redis(url.as_str())?),
        (StoreMode::Failover, Some(url)) => {
            let primary = Arc::new(redis(url.as_str())?);
            Arc::new(FailoverStore::new(primary, local()))
        }
        (_, None) => local(),
    };
    Ok(store)
}

/// Validates `config`, loads the policy table and assembles the engine.
pub fn build_engine(config: &Config) -> Result<QuotaEngine> {
    config.validate()?;
    let policies = config.load_policies()?;
    let store = build_store(config)?;

    QuotaEngine::builder(policies, store)
        .key_prefix(config.key_prefix.clone())
        .failure_policies(config.failure_policies())
        .build()
}

pub struct Server {
    engine: Arc<QuotaEngine>,
    listener: TcpListener,
}

impl Server {
    /// Opens the engine and binds the listener. Port 0 picks a free port.
    pub async fn bind(engine: QuotaEngine, addr: SocketAddr) -> anyhow::Result<Self> {
        engine.open().await?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            engine: Arc::new(engine),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serves until `shutdown` completes, then drains and closes the engine.
    pub async fn run_until(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        let app = create_app(Arc::clone(&self.engine));

        tracing::info!("quotaguard listening on {}", addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        self.engine.close().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
