use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use chrono::SecondsFormat;
use common_auth::{AuthContext, IssuedToken};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::flows::{FlowError, NewAccount, UserUpdate};
use crate::store::UserRecord;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Empty means `password` carries a previously issued token.
    #[serde(default)]
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: String,
}

impl From<IssuedToken> for LoginResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            token_type: issued.token_type,
            expires_at: issued.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct NewUserEnvelope {
    pub newuser: NewUser,
}

#[derive(Debug, Deserialize)]
pub struct NewPasswordRequest {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPasswordRequestEnvelope {
    pub new_password_request: NewPasswordRequest,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmationRequest {
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserChanges {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "newPw")]
    pub new_password: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct UserChangesEnvelope {
    pub user: UserChanges,
}

#[derive(Debug, Deserialize)]
pub struct GroupsRequest {
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub groups: Vec<String>,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        Self {
            id: record.id,
            name: record.username,
            active: record.active,
            groups: record.groups,
        }
    }
}

fn outcome(err: &FlowError) -> &'static str {
    match err {
        FlowError::Validation(_) => "invalid_input",
        FlowError::InvalidCredentials => "invalid_credentials",
        FlowError::UsernameTaken(_) => "conflict",
        FlowError::ResetMismatch => "mismatch",
        FlowError::UnknownUser => "unknown_user",
        FlowError::Auth(_) => "unauthenticated",
        FlowError::Hash(_) | FlowError::Store(_) | FlowError::Mail(_) => "error",
    }
}

pub async fn login_user(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let Json(login) = payload.map_err(|rejection| {
        state.metrics.login_attempt("invalid_input");
        ApiError::from(rejection)
    })?;

    let result = if login.username.is_empty() {
        state.flows.login_with_token(&login.password).await
    } else {
        state.flows.login(&login.username, &login.password).await
    };

    match result {
        Ok(issued) => {
            state.metrics.login_attempt("success");
            Ok(Json(issued.into()))
        }
        Err(err) => {
            state.metrics.login_attempt(outcome(&err));
            Err(err.into())
        }
    }
}

pub async fn register_user(
    State(state): State<AppState>,
    payload: Result<Json<NewUserEnvelope>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(NewUserEnvelope { newuser }) = payload.map_err(|rejection| {
        state.metrics.registration("invalid_input");
        ApiError::from(rejection)
    })?;

    let account = NewAccount {
        username: newuser.username,
        password: newuser.password,
        email: newuser.email,
    };
    match state.flows.register(account).await {
        Ok(_) => {
            state.metrics.registration("created");
            Ok((StatusCode::CREATED, Json(json!({}))))
        }
        Err(err) => {
            state.metrics.registration(outcome(&err));
            Err(err.into())
        }
    }
}

pub async fn confirm_registration(
    State(state): State<AppState>,
    payload: Result<Json<ConfirmationRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let Json(request) = payload?;
    let issued = state.flows.confirm_registration(&request.token).await?;
    Ok(Json(issued.into()))
}

pub async fn request_password_reset(
    State(state): State<AppState>,
    payload: Result<Json<NewPasswordRequestEnvelope>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(envelope) = payload.map_err(|rejection| {
        state.metrics.password_reset("invalid_input");
        ApiError::from(rejection)
    })?;
    let request = envelope.new_password_request;

    match state
        .flows
        .request_password_reset(&request.username, &request.email)
        .await
    {
        Ok(()) => {
            state.metrics.password_reset("sent");
            Ok((StatusCode::CREATED, Json(json!({}))))
        }
        Err(err) => {
            state.metrics.password_reset(outcome(&err));
            Err(err.into())
        }
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    AuthContext(principal): AuthContext,
) -> ApiResult<Json<Value>> {
    let users = state
        .flows
        .list_users(&principal)
        .await?
        .into_iter()
        .map(User::from)
        .collect::<Vec<_>>();
    Ok(Json(json!({ "users": users })))
}

pub async fn update_user(
    State(state): State<AppState>,
    AuthContext(principal): AuthContext,
    user_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UserChangesEnvelope>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Path(user_id) = user_id?;
    let Json(UserChangesEnvelope { user: changes }) = payload?;

    let update = UserUpdate {
        name: changes.name,
        new_password: changes.new_password,
        active: changes.active,
        groups: changes.groups,
    };
    let record = state.flows.update_user(&principal, user_id, update).await?;
    Ok(Json(json!({ "user": User::from(record) })))
}

pub async fn set_user_groups(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<GroupsRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Path(user_id) = user_id?;
    let Json(request) = payload?;
    state.flows.set_groups(user_id, &request.groups).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_user_active(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ActiveRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Path(user_id) = user_id?;
    let Json(request) = payload?;
    state.flows.set_active(user_id, request.active).await?;
    Ok(StatusCode::NO_CONTENT)
}
