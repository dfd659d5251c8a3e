//! HTTP API server for Cadence

pub mod health;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::gateway::Gateways;
use crate::session::{SessionSettings, SessionStore};
use crate::{Error, Result};

/// Names of the configured collaborators, for readiness reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderInfo {
    pub stt: String,
    pub tts: String,
    pub llm_model: String,
}

impl ProviderInfo {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            stt: format!("{:?}", config.voice.stt_provider).to_lowercase(),
            tts: format!("{:?}", config.voice.tts_provider).to_lowercase(),
            llm_model: config.llm.model.clone(),
        }
    }
}

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub gateways: Gateways,
    pub store: SessionStore,
    pub settings: SessionSettings,
    pub providers: ProviderInfo,
}

impl ApiState {
    #[must_use]
    pub fn new(gateways: Gateways, store: SessionStore, settings: SessionSettings) -> Self {
        Self {
            gateways,
            store,
            settings,
            providers: ProviderInfo {
                stt: "custom".to_string(),
                tts: "custom".to_string(),
                llm_model: "custom".to_string(),
            },
        }
    }

    #[must_use]
    pub fn providers(mut self, providers: ProviderInfo) -> Self {
        self.providers = providers;
        self
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    idle_timeout: Duration,
}

impl ApiServer {
    #[must_use]
    pub fn new(state: ApiState, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            port,
            idle_timeout: Duration::from_secs(600),
        }
    }

    /// Close sessions without inbound traffic for this long
    #[must_use]
    pub const fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        // CORS layer for cross-origin requests from browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to bind API server: {e}")))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// On shutdown every live session is signalled and the server waits for
    /// their connections to close.
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        tracing::info!(addr = %local, "API server listening");

        let reaper = self
            .state
            .store
            .spawn_reaper(self.idle_timeout, shutdown.child_token());

        let store = self.state.store.clone();
        let signal = shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                signal.cancelled().await;
                store.cancel_all().await;
            })
            .await
            .map_err(|e| Error::Transport(format!("API server error: {e}")))?;

        shutdown.cancel();
        let _ = reaper.await;
        tracing::info!("API server stopped");
        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
