use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderValue};

use crate::claims::Principal;
use crate::error::{AuthError, AuthResult};
use crate::tokens::TokenService;

/// Recover the principal carried by the request's bearer token.
///
/// No `Authorization` header yields `Ok(None)`. A header that is present but
/// malformed, or a token that fails verification, yields an error.
pub fn extract_principal(
    headers: &HeaderMap,
    tokens: &TokenService,
) -> AuthResult<Option<Principal>> {
    let Some(header_value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };

    let token = parse_bearer(header_value)?;
    let principal = tokens.verify_principal(&token)?;
    Ok(Some(principal))
}

/// Principal attached by an authenticated or role gate.
#[derive(Debug, Clone)]
pub struct AuthContext(pub Principal);

impl AuthContext {
    pub fn principal(&self) -> &Principal {
        &self.0
    }

    pub fn into_principal(self) -> Principal {
        self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(Self)
            .ok_or(AuthError::MissingAuthorization)
    }
}

/// Principal attached by a public gate, if the caller presented a valid token.
#[derive(Debug, Clone, Default)]
pub struct MaybeAuthContext(pub Option<Principal>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuthContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Principal>().cloned()))
    }
}

pub fn parse_bearer(value: &HeaderValue) -> AuthResult<String> {
    let raw = value
        .to_str()
        .map_err(|_| AuthError::InvalidAuthorization)?
        .trim();

    let token = raw
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthorization)?
        .trim();

    if token.is_empty() {
        return Err(AuthError::InvalidAuthorization);
    }

    Ok(token.to_owned())
}
