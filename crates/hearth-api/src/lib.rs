pub mod cache;
pub mod rest;
pub mod security;

use crate::cache::ApiCache;
use axum::Router;
use hearth_store::LeaseStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Read-only lease API for one node. Both /api endpoints are guarded by
/// the shared `?token=` secret and memoized in a short-TTL cache.
pub struct ApiServer {
    listen_addr: SocketAddr,
    store: LeaseStore,
    api_token: String,
    cache_ttl: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub store: LeaseStore,
    pub api_token: Arc<String>,
    pub cache: Arc<ApiCache>,
}

impl ApiServer {
    pub fn new(
        listen_addr: SocketAddr,
        store: LeaseStore,
        api_token: String,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            listen_addr,
            store,
            api_token,
            cache_ttl,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            store: self.store.clone(),
            api_token: Arc::new(self.api_token.clone()),
            cache: Arc::new(ApiCache::new(self.cache_ttl)),
        };

        Router::new()
            .merge(rest::router())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("read API listening on {}", self.listen_addr);

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}
