//! Gateway server implementation

use crate::auth::TokenVerifier;
use crate::config::{SecretRef, StreamGateConfig};
use crate::error::{Error, Result};
use crate::gateway::handler::{ApiHandler, AppState};
use crate::publisher::ProgressPublisher;
use crate::registry::ConnectionRegistry;
use crate::router::ChannelRouter;
use crate::session::stream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// StreamGate gateway server
pub struct Gateway {
    config: StreamGateConfig,
    state: Arc<RwLock<GatewayState>>,
    verifier: Arc<TokenVerifier>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<ChannelRouter>,
    shutdown: CancellationToken,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl Gateway {
    /// Create a new gateway with the given configuration
    pub fn new(config: StreamGateConfig) -> Result<Self> {
        let verifier = Arc::new(TokenVerifier::from_config(&config.auth)?);
        let registry = Arc::new(ConnectionRegistry::new(&config.limits));
        let router = Arc::new(ChannelRouter::new());

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            verifier,
            registry,
            router,
            shutdown: CancellationToken::new(),
            local_addr: Arc::new(RwLock::new(None)),
        })
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Start the gateway
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Gateway("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting StreamGate gateway");

        let listener = TcpListener::bind((
            self.config.gateway.host.as_str(),
            self.config.gateway.port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(local_addr);

        let app = ApiHandler::router(self.app_state());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!("Gateway server error: {}", e);
            }
        });

        self.start_sweeper();

        *self.state.write().await = GatewayState::Running;

        tracing::info!("StreamGate gateway listening on {}", local_addr);

        Ok(())
    }

    /// Stop the gateway
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping StreamGate gateway");

        // Stop accepting, then close every live session; each session
        // releases itself through the ordinary teardown path.
        self.shutdown.cancel();
        for handle in self.registry.all_handles() {
            handle.close();
        }

        *self.state.write().await = GatewayState::Stopped;

        tracing::info!("StreamGate gateway stopped");

        Ok(())
    }

    /// Periodic eviction of connections past their lifetime or idle limit
    fn start_sweeper(&self) {
        let registry = self.registry.clone();
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.limits.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        for handle in registry.expired(now) {
                            tracing::warn!(
                                identity = %handle.identity(),
                                handle = %handle.id(),
                                age_ms = now - handle.created_at(),
                                "Evicting expired connection"
                            );
                            stream::teardown(&handle, &router, &registry).await;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Publisher for the task executor boundary
    pub fn publisher(&self) -> ProgressPublisher {
        ProgressPublisher::new(self.router.clone())
    }

    /// Get the credential verifier
    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    /// Get the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the channel router
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    /// Get configuration
    pub fn config(&self) -> &StreamGateConfig {
        &self.config
    }

    /// Address actually bound, once running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    fn app_state(&self) -> AppState {
        AppState {
            verifier: self.verifier.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            gateway_config: self.config.gateway.clone(),
            state: self.state.clone(),
        }
    }
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: StreamGateConfig,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: StreamGateConfig::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: StreamGateConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway.host = host.into();
        self
    }

    /// Set the gateway port
    pub fn port(mut self, port: u16) -> Self {
        self.config.gateway.port = port;
        self
    }

    /// Set an inline credential secret
    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.auth.secret = SecretRef::inline(secret);
        self
    }

    /// Set the per-identity connection cap
    pub fn connection_cap(mut self, cap: usize) -> Self {
        self.config.limits.max_connections_per_user = cap;
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        Gateway::new(self.config)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
