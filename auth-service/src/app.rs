use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use common_auth::{Gate, GateExt, TokenService, ROLE_ADMIN};
use common_http_errors::ApiError;

use crate::flows::CredentialFlows;
use crate::metrics::AuthMetrics;
use crate::user_handlers::{
    confirm_registration, list_users, login_user, register_user, request_password_reset,
    set_user_active, set_user_groups, update_user,
};

#[derive(Clone)]
pub struct AppState {
    pub flows: Arc<CredentialFlows>,
    pub tokens: Arc<TokenService>,
    pub metrics: Arc<AuthMetrics>,
}

impl AppState {
    pub fn new(flows: Arc<CredentialFlows>, metrics: Arc<AuthMetrics>) -> Self {
        let tokens = flows.tokens().clone();
        Self {
            flows,
            tokens,
            metrics,
        }
    }
}

impl FromRef<AppState> for Arc<TokenService> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl FromRef<AppState> for Arc<AuthMetrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(metrics): State<Arc<AuthMetrics>>) -> Response {
    match metrics.render() {
        Ok(response) => response,
        Err(err) => ApiError::internal(err).into_response(),
    }
}

/// Routes grouped by gate. Layers are not applied here; see `main`.
pub fn build_router(state: AppState) -> Router {
    let tokens = state.tokens.clone();

    let public = Router::<AppState>::new()
        .route("/login", post(login_user))
        .route("/newusers", post(register_user))
        .route("/newPasswordRequests", post(request_password_reset))
        .route("/confirmations", post(confirm_registration))
        .gated(Gate::public(tokens.clone()));

    let authenticated = Router::<AppState>::new()
        .route("/users", get(list_users))
        .route("/users/:user_id", put(update_user))
        .gated(Gate::authenticated(tokens.clone()));

    let admin = Router::<AppState>::new()
        .route("/users/:user_id/groups", put(set_user_groups))
        .route("/users/:user_id/active", put(set_user_active))
        .gated(Gate::role(tokens, ROLE_ADMIN));

    Router::<AppState>::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}
