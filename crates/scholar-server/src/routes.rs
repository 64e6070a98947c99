//! HTTP routes for the Scholar server.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use scholar_core::{ExecutionResult, RegistryStats, SessionRegistry};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServerResult;
use crate::identity::{AuthUser, IdentityError, IdentityProvider};
use crate::protocol::{
    CleanupResponse, ErrorBody, ExecuteCellRequest, HealthResponse, RestartResponse, ServiceInfo,
};

/// Application state shared across handlers.
pub struct AppState {
    /// Kernels owned by this process.
    pub registry: Arc<SessionRegistry>,
    /// Resolves the caller of each `/api` request.
    pub identity: Arc<dyn IdentityProvider>,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = IdentityError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state.identity.identify(&parts.headers).map(AuthUser)
    }
}

/// Create the router with all routes.
///
/// `allowed_origins` restricts CORS; an empty list allows any origin.
pub fn create_router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/execute/cell", post(execute_cell_handler))
        .route("/api/execute/restart", post(restart_handler))
        .route("/api/execute/cleanup", post(cleanup_handler))
        .route("/api/execute/stats", get(stats_handler))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

async fn index_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "Scholar code execution service",
        status: "running",
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Run a cell in the caller's kernel.
async fn execute_cell_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    body: Result<Json<ExecuteCellRequest>, JsonRejection>,
) -> ServerResult<Response> {
    let code = body
        .ok()
        .and_then(|Json(request)| request.code)
        .filter(|code| !code.is_empty());
    let Some(code) = code else {
        let body = ErrorBody {
            error: "No code provided".to_string(),
        };
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    };

    // Kernel IPC is synchronous; keep it off the async workers.
    let registry = state.registry.clone();
    let result: ExecutionResult =
        tokio::task::spawn_blocking(move || registry.execute(&user, &code)).await?;
    Ok(Json(result).into_response())
}

async fn restart_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ServerResult<Response> {
    let registry = state.registry.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = registry.restart(&user);
        (user, outcome)
    })
    .await?;

    let response = match outcome {
        (_, Ok(())) => (StatusCode::OK, Json(RestartResponse::restarted())),
        (user, Err(e)) => {
            tracing::error!("Kernel restart failed for user {}: {}", user, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RestartResponse::failed(e.to_string())),
            )
        }
    };
    Ok(response.into_response())
}

/// Logout hook: tear down the caller's kernel.
async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ServerResult<Json<CleanupResponse>> {
    let registry = state.registry.clone();
    let cleaned = tokio::task::spawn_blocking(move || registry.cleanup(&user)).await?;
    Ok(Json(CleanupResponse {
        success: true,
        cleaned,
    }))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
) -> Json<RegistryStats> {
    Json(state.registry.stats())
}
