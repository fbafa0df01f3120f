//! HTTP front end: the protected endpoint behind the admission middleware.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::config::{Config, EvictionConfig};
use crate::policy::PolicyTable;
use crate::rate_limit::{KeyedTokenBucket, RateLimitLayer, RateLimiter};
use crate::sweeper::spawn_idle_sweeper;

/// Body returned by the protected endpoint.
pub const SUCCESS_BODY: &str = "{success: true}";

/// Errors from binding or running the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind to address: {0}")]
    Bind(#[source] std::io::Error),
    /// The server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Router exposing `GET /foo` behind the rate limit layer.
///
/// The layer is a route layer, so unknown paths get a plain 404 without
/// touching any client's budget.
pub fn router<L>(limiter: Arc<L>) -> Router
where
    L: RateLimiter + 'static,
{
    Router::new().route("/foo", get(foo)).route_layer(RateLimitLayer::from_shared(limiter))
}

async fn foo() -> &'static str {
    SUCCESS_BODY
}

/// A bound, not yet running server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    limiter: Arc<KeyedTokenBucket<PolicyTable>>,
    eviction: Option<EvictionConfig>,
}

impl Server {
    /// Build the limiter from `config` and bind the listen address.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let limiter = Arc::new(KeyedTokenBucket::new(config.policy_resolver()));
        let listener =
            TcpListener::bind(config.server.listen_address).await.map_err(ServerError::Bind)?;
        Ok(Self { listener, limiter, eviction: config.eviction })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Bind)
    }

    /// The shared limiter, e.g. to update policies at runtime.
    pub fn limiter(&self) -> &Arc<KeyedTokenBucket<PolicyTable>> {
        &self.limiter
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.eviction.map(|eviction| {
            tracing::info!(
                target: "turnstile::server",
                idle_timeout_secs = eviction.idle_timeout.as_secs(),
                sweep_interval_secs = eviction.sweep_interval.as_secs(),
                "idle bucket eviction enabled"
            );
            spawn_idle_sweeper(self.limiter.clone(), eviction)
        });

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(target: "turnstile::server", %addr, "rate limiter listening");
        }

        let result = axum::serve(self.listener, router(self.limiter))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerError::Serve);

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        tracing::info!(target: "turnstile::server", "rate limiter stopped");
        result
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(
                target: "turnstile::server",
                error = %err,
                "failed to listen for ctrl-c"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(
                    target: "turnstile::server",
                    error = %err,
                    "failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!(target: "turnstile::server", "shutdown signal received");
}
