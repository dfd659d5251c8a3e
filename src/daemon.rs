//! Server daemon: owns the session store and API server for one process

use tokio_util::sync::CancellationToken;

use crate::api::{ApiServer, ApiState, ProviderInfo};
use crate::config::Config;
use crate::gateway::Gateways;
use crate::session::SessionStore;
use crate::voice::gateways_from_config;
use crate::Result;

/// The Cadence daemon - serves voice sessions until interrupted
pub struct Daemon {
    config: Config,
    gateways: Gateways,
}

impl Daemon {
    /// Create a daemon with collaborators built from `config`
    ///
    /// # Errors
    ///
    /// Returns error if a selected provider has no API key
    pub fn new(config: Config) -> Result<Self> {
        let gateways = gateways_from_config(&config)?;
        Ok(Self { config, gateways })
    }

    /// Create a daemon with caller-supplied collaborators
    #[must_use]
    pub const fn with_gateways(config: Config, gateways: Gateways) -> Self {
        Self { config, gateways }
    }

    /// Build the API server this daemon runs
    #[must_use]
    pub fn api_server(&self) -> ApiServer {
        let store = SessionStore::new(self.config.session.max_sessions);
        let state = ApiState::new(
            self.gateways.clone(),
            store,
            self.config.session_settings(),
        )
        .providers(ProviderInfo::from_config(&self.config));

        ApiServer::new(state, self.config.server.port).idle_timeout(self.config.idle_timeout())
    }

    /// Run the daemon until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the API server fails
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            port = self.config.server.port,
            max_sessions = self.config.session.max_sessions,
            "daemon running"
        );

        // Set up shutdown signal
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
        });

        self.api_server().run(shutdown).await?;

        tracing::info!("daemon stopped");
        Ok(())
    }
}
