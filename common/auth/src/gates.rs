//! Request gates wrapped around handlers as axum route layers.
//!
//! Three variants share one admission routine:
//!
//! * public: attach the principal when a valid token is presented, otherwise continue anonymously;
//! * authenticated: require a valid token, rejecting with 401 before the handler runs;
//! * role: run the authenticated admission, then require membership in one group (403 otherwise).
//!
//! The principal is inserted into request extensions only after admission succeeds,
//! so handlers read either a complete [`Principal`] or nothing.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::claims::Principal;
use crate::error::{AuthError, AuthResult};
use crate::extractors::extract_principal;
use crate::guards::ensure_role;
use crate::tokens::TokenService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateKind {
    Public,
    Authenticated,
    Role(String),
}

#[derive(Clone)]
pub struct Gate {
    tokens: Arc<TokenService>,
    kind: GateKind,
}

impl Gate {
    pub fn public(tokens: Arc<TokenService>) -> Self {
        Self {
            tokens,
            kind: GateKind::Public,
        }
    }

    pub fn authenticated(tokens: Arc<TokenService>) -> Self {
        Self {
            tokens,
            kind: GateKind::Authenticated,
        }
    }

    pub fn role(tokens: Arc<TokenService>, role: impl Into<String>) -> Self {
        Self {
            tokens,
            kind: GateKind::Role(role.into()),
        }
    }

    pub fn kind(&self) -> &GateKind {
        &self.kind
    }

    /// Decide whether a request with these headers may reach the handler.
    pub fn admit(&self, headers: &HeaderMap) -> AuthResult<Option<Principal>> {
        match &self.kind {
            GateKind::Public => match extract_principal(headers, &self.tokens) {
                Ok(principal) => Ok(principal),
                Err(err) => {
                    debug!(error = %err, "continuing anonymously");
                    Ok(None)
                }
            },
            GateKind::Authenticated => self.authenticate(headers).map(Some),
            GateKind::Role(role) => {
                let principal = self.authenticate(headers)?;
                ensure_role(&principal, role)?;
                Ok(Some(principal))
            }
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> AuthResult<Principal> {
        extract_principal(headers, &self.tokens)?.ok_or(AuthError::MissingAuthorization)
    }
}

/// Middleware entry point installed by [`GateExt::gated`].
pub async fn run_gate(State(gate): State<Gate>, mut request: Request, next: Next) -> Response {
    request.extensions_mut().remove::<Principal>();

    match gate.admit(request.headers()) {
        Ok(Some(principal)) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(err) => {
            let correlation_id = Uuid::new_v4();
            warn!(
                %correlation_id,
                http.method = %request.method(),
                http.path = %request.uri().path(),
                gate = ?gate.kind,
                error = %err,
                "gate rejected request"
            );
            err.into_response()
        }
    }
}

pub trait GateExt {
    /// Wrap every route registered so far in `gate`. Call after adding routes.
    fn gated(self, gate: Gate) -> Self;
}

impl<S> GateExt for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn gated(self, gate: Gate) -> Self {
        self.route_layer(from_fn_with_state(gate, run_gate))
    }
}
