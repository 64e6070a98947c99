//! Scholar code execution server.
//!
//! Exposes per-user Python kernels over HTTP for the learning platform's
//! notebook viewer.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Routes**: execute/restart/cleanup/stats handlers
//! - **Identity**: turns request headers into a user id
//! - **Protocol**: request and response bodies
//!
//! Kernels and the session registry live in `scholar-core`.

pub mod error;
pub mod identity;
pub mod protocol;
pub mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scholar_core::coordination::{DEFAULT_HINT_TTL, DEFAULT_REDIS_TIMEOUT};
use scholar_core::{
    KernelCommand, KernelConfig, OwnershipHints, ProcessLauncher, RedisHintStore, SessionRegistry,
};

pub use error::{ServerError, ServerResult};
pub use identity::{AuthUser, HeaderIdentity, IdentityError, IdentityProvider, JwtIdentity};
pub use routes::{AppState, create_router};

/// Origins of the local frontend dev servers, always allowed alongside `FRONTEND_URL`.
const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:3001"];

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Coordination store; hints are disabled when unset.
    pub redis_url: Option<String>,
    /// Secret for HS256 bearer tokens.
    pub jwt_secret: Option<String>,
    /// Header carrying a gateway-verified user id. Used when no JWT secret is set.
    pub identity_header: Option<String>,
    /// CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Identifier written to ownership hints. Defaults to the process id.
    pub worker_id: Option<String>,
    /// Python interpreter for kernels. Detected when unset.
    pub python: Option<PathBuf>,
    /// Kernel timeouts.
    pub kernel: KernelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            redis_url: None,
            jwt_secret: None,
            identity_header: None,
            allowed_origins: Vec::new(),
            worker_id: None,
            python: None,
            kernel: KernelConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> ServerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = var("HOST") {
            config.host = host;
        }
        if let Some(port) = var("PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ServerError::Config(format!("Invalid PORT: {}", port)))?;
        }
        config.redis_url = var("REDIS_URL");
        config.jwt_secret = var("JWT_SECRET_KEY");
        config.identity_header = var("SCHOLAR_IDENTITY_HEADER");
        config.worker_id = var("SCHOLAR_WORKER_ID");
        config.python = var("SCHOLAR_PYTHON").map(PathBuf::from);

        if let Some(secs) = var("SCHOLAR_EXECUTION_TIMEOUT_SECS") {
            config.kernel.execution_timeout = parse_secs("SCHOLAR_EXECUTION_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = var("SCHOLAR_STARTUP_TIMEOUT_SECS") {
            config.kernel.startup_timeout = parse_secs("SCHOLAR_STARTUP_TIMEOUT_SECS", &secs)?;
        }

        config.allowed_origins = var("FRONTEND_URL").into_iter().collect();
        config
            .allowed_origins
            .extend(DEV_ORIGINS.iter().map(|o| o.to_string()));

        Ok(config)
    }

    /// Identity provider selected by this configuration.
    ///
    /// A JWT secret takes precedence over a trusted header. Having neither
    /// is an error: the server never runs unauthenticated.
    pub fn identity_provider(&self) -> ServerResult<Arc<dyn IdentityProvider>> {
        if let Some(secret) = &self.jwt_secret {
            return Ok(Arc::new(JwtIdentity::new(secret)));
        }
        if let Some(header) = &self.identity_header {
            return Ok(Arc::new(HeaderIdentity::new(header)?));
        }
        Err(ServerError::Config(
            "No identity provider configured. Set JWT_SECRET_KEY or SCHOLAR_IDENTITY_HEADER."
                .to_string(),
        ))
    }

    fn resolved_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| std::process::id().to_string())
    }
}

fn parse_secs(name: &str, value: &str) -> ServerResult<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ServerError::Config(format!("Invalid {}: {}", name, value))),
    }
}

/// Connect ownership hints, probing the store once.
fn connect_hints(redis_url: Option<&str>, worker_id: String) -> OwnershipHints {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URL not set, ownership hints disabled");
        return OwnershipHints::disabled(worker_id);
    };
    match RedisHintStore::open(url, DEFAULT_REDIS_TIMEOUT) {
        Ok(store) => OwnershipHints::connect(Arc::new(store), worker_id, DEFAULT_HINT_TTL),
        Err(e) => {
            tracing::warn!("Invalid REDIS_URL, ownership hints disabled: {}", e);
            OwnershipHints::disabled(worker_id)
        }
    }
}

/// Start the Scholar server.
pub async fn serve(config: ServerConfig) -> ServerResult<()> {
    let identity = config.identity_provider()?;

    let command = match &config.python {
        Some(python) => KernelCommand::python(python),
        None => KernelCommand::detect_python()?,
    };
    tracing::info!("Kernels will run {}", command.display_name());
    let launcher = Arc::new(ProcessLauncher::new(command));

    let worker_id = config.resolved_worker_id();
    let redis_url = config.redis_url.clone();
    let hints =
        tokio::task::spawn_blocking(move || connect_hints(redis_url.as_deref(), worker_id)).await?;

    let registry = Arc::new(SessionRegistry::new(launcher, config.kernel.clone(), hints));
    let state = Arc::new(AppState {
        registry: registry.clone(),
        identity,
    });
    let app = create_router(state, &config.allowed_origins);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| {
            ServerError::Config(format!("Invalid address: {}:{}", config.host, config.port))
        })?;

    tracing::info!(
        "Starting Scholar server at http://{} (worker {})",
        addr,
        registry.worker_id()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // Handle Ctrl+C for graceful shutdown
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    // Kernels are child processes; do not leave them behind.
    tokio::task::spawn_blocking(move || registry.shutdown_all()).await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.kernel.execution_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("REDIS_URL", "redis://cache:6379"),
            ("JWT_SECRET_KEY", "s3cret"),
            ("FRONTEND_URL", "https://learn.example.com"),
            ("SCHOLAR_WORKER_ID", "web-2"),
            ("SCHOLAR_EXECUTION_TIMEOUT_SECS", "90"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.resolved_worker_id(), "web-2");
        assert_eq!(config.kernel.execution_timeout, Duration::from_secs(90));
        assert_eq!(
            config.allowed_origins,
            vec![
                "https://learn.example.com",
                "http://localhost:3000",
                "http://localhost:3001"
            ]
        );
    }

    #[test]
    fn test_blank_variables_are_ignored() {
        let config = ServerConfig::from_lookup(lookup(&[("REDIS_URL", "  ")])).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_invalid_numbers_are_config_errors() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
        let err = ServerConfig::from_lookup(lookup(&[("SCHOLAR_EXECUTION_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_identity_provider_required() {
        let config = ServerConfig::default();
        assert!(matches!(config.identity_provider(), Err(ServerError::Config(_))));

        let config = ServerConfig {
            identity_header: Some("x-user-id".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.identity_provider().is_ok());
    }

    #[test]
    fn test_hints_disabled_without_redis() {
        let hints = connect_hints(None, "w".to_string());
        assert!(!hints.is_available());
        assert_eq!(hints.worker_id(), "w");
    }
}
