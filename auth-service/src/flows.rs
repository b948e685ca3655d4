use std::sync::Arc;

use common_auth::{
    ensure_role, AuthError, IssuedToken, Principal, TokenPurpose, TokenService, DEFAULT_ROLE,
    ROLE_ADMIN,
};
use common_http_errors::ApiError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mailer::{self, MailError, Mailer};
use crate::password::{HashError, PasswordHasher, Salt};
use crate::store::{NewUserRecord, StoreError, UserRecord, UserStore};

pub const CONFIRM_MAIL_ROUTE: &str = "confirm-mail";
pub const PASSWORD_RECOVERY_ROUTE: &str = "password-recovery";

const WRONG_CREDENTIALS: &str = "Wrong username or password.";

/// Fixed salt used to burn one KDF derivation for unknown usernames.
const DUMMY_SALT: [u8; 16] = *b"quiz-login-dummy";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("{0}")]
    Validation(String),
    /// Unknown user, wrong password and inactive account all collapse here.
    #[error("wrong username or password")]
    InvalidCredentials,
    #[error("username '{0}' already exists")]
    UsernameTaken(String),
    #[error("e-mail does not match the account")]
    ResetMismatch,
    #[error("user not found")]
    UnknownUser,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Mail(#[from] MailError),
}

impl From<StoreError> for FlowError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Duplicate(username) => FlowError::UsernameTaken(username),
            StoreError::NotFound(_) => FlowError::UnknownUser,
            other => FlowError::Store(other),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(value: FlowError) -> Self {
        match value {
            FlowError::Validation(message) => ApiError::validation("invalid_input", message),
            FlowError::InvalidCredentials => ApiError::Unauthenticated {
                message: WRONG_CREDENTIALS,
            },
            FlowError::UsernameTaken(_) => {
                ApiError::conflict("username_taken", "Username already exists.")
            }
            FlowError::ResetMismatch => ApiError::conflict(
                "mail_mismatch",
                "E-mail address and username do not coincide.",
            ),
            FlowError::UnknownUser => ApiError::NotFound {
                code: "user_not_found",
                trace_id: None,
            },
            FlowError::Auth(err) => err.into(),
            FlowError::Hash(_) | FlowError::Store(_) | FlowError::Mail(_) => {
                ApiError::internal(value)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub new_password: Option<String>,
    pub active: Option<bool>,
    pub groups: Option<Vec<String>>,
}

/// Login, registration, confirmation, password reset and account updates.
pub struct CredentialFlows {
    store: Arc<dyn UserStore>,
    mailer: Arc<dyn Mailer>,
    hasher: Arc<PasswordHasher>,
    tokens: Arc<TokenService>,
    app_url: String,
}

impl CredentialFlows {
    pub fn new(
        store: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        hasher: Arc<PasswordHasher>,
        tokens: Arc<TokenService>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            hasher,
            tokens,
            app_url: app_url.into(),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, FlowError> {
        let Some(user) = self.store.find_by_username(username).await? else {
            // Keep the unknown-user path as slow as a real comparison.
            let _ = self
                .hasher
                .clone()
                .derive_blocking(password.to_string(), Salt::from_bytes(DUMMY_SALT))
                .await;
            debug!("login for unknown username");
            return Err(FlowError::InvalidCredentials);
        };

        let salt = Salt::from_base64(&user.salt)?;
        let matches = self
            .hasher
            .clone()
            .verify_blocking(password.to_string(), salt, user.password_hash.clone())
            .await?;
        if !matches {
            debug!(user_id = user.id, "password mismatch");
            return Err(FlowError::InvalidCredentials);
        }
        if !user.active {
            debug!(user_id = user.id, "login for inactive account");
            return Err(FlowError::InvalidCredentials);
        }

        let issued = self.tokens.issue_session(&user.principal())?;
        info!(user_id = user.id, "login succeeded");
        Ok(issued)
    }

    /// Accepts a token in place of a password. A session token is echoed back
    /// unchanged; a password-recovery token is exchanged for a session on an
    /// active account. Confirmation tokens are refused.
    pub async fn login_with_token(&self, token: &str) -> Result<IssuedToken, FlowError> {
        if let Ok(claims) = self.tokens.verify(token) {
            let expires_at = claims.expires_at().ok_or(FlowError::InvalidCredentials)?;
            return Ok(IssuedToken {
                token: token.to_string(),
                expires_at,
                token_type: "Bearer",
            });
        }

        let claims = self
            .tokens
            .verify_purpose(token, TokenPurpose::PasswordRecovery)
            .map_err(|_| FlowError::InvalidCredentials)?;
        let user = match self.store.find_by_id(claims.uid).await? {
            Some(user) if user.active => user,
            _ => {
                debug!(user_id = claims.uid, "recovery login for missing or inactive account");
                return Err(FlowError::InvalidCredentials);
            }
        };

        let issued = self.tokens.issue_session(&user.principal())?;
        info!(user_id = user.id, "recovery token exchanged for session");
        Ok(issued)
    }

    /// Stores an inactive account and mails the confirmation link. Returns the new id.
    pub async fn register(&self, account: NewAccount) -> Result<i64, FlowError> {
        require_non_empty("username", &account.username)?;
        require_non_empty("password", &account.password)?;
        require_email(&account.email)?;

        if self.store.username_exists(&account.username).await? {
            debug!(username = %account.username, "registration for existing username");
            return Err(FlowError::UsernameTaken(account.username));
        }

        let (salt, password_hash) = self
            .hasher
            .clone()
            .register_blocking(account.password.clone())
            .await?;
        let mail_hash = self
            .hasher
            .clone()
            .derive_blocking(account.email.clone(), salt)
            .await?;

        let id = self
            .store
            .insert(NewUserRecord {
                username: account.username.clone(),
                salt: salt.to_base64(),
                password_hash: password_hash.to_base64(),
                mail_hash: mail_hash.to_base64(),
                active: false,
                groups: vec![DEFAULT_ROLE.to_string()],
            })
            .await?;

        let confirmation = self.tokens.issue_mail_token(
            &Principal::new(id, account.username.clone(), Vec::<String>::new()),
            TokenPurpose::ConfirmMail,
        )?;
        let link = mailer::link(&self.app_url, CONFIRM_MAIL_ROUTE, &confirmation.token);
        self.mailer
            .send(mailer::registration_mail(&account.email, &account.username, &link))
            .await?;

        info!(user_id = id, "registered pending account");
        Ok(id)
    }

    /// Activates the account named by a registration mail token and opens a session for it.
    pub async fn confirm_registration(&self, token: &str) -> Result<IssuedToken, FlowError> {
        let claims = self.tokens.verify_purpose(token, TokenPurpose::ConfirmMail)?;
        let Some(mut user) = self.store.find_by_id(claims.uid).await? else {
            debug!(user_id = claims.uid, "confirmation for unknown user");
            return Err(AuthError::InvalidToken.into());
        };

        if !user.active {
            self.store.update_active_flag(user.id, true).await?;
            user.active = true;
            info!(user_id = user.id, "account activated");
        }

        Ok(self.tokens.issue_session(&user.principal())?)
    }

    pub async fn request_password_reset(
        &self,
        username: &str,
        email: &str,
    ) -> Result<(), FlowError> {
        require_non_empty("username", username)?;
        require_email(email)?;

        let Some(user) = self.store.find_by_username(username).await? else {
            return Err(FlowError::UnknownUser);
        };

        let salt = Salt::from_base64(&user.salt)?;
        let matches = self
            .hasher
            .clone()
            .verify_blocking(email.to_string(), salt, user.mail_hash.clone())
            .await?;
        if !matches {
            warn!(user_id = user.id, "password reset with mismatching e-mail");
            return Err(FlowError::ResetMismatch);
        }

        let reset = self.tokens.issue_mail_token(
            &Principal::new(user.id, user.username.clone(), Vec::<String>::new()),
            TokenPurpose::PasswordRecovery,
        )?;
        let link = mailer::link(&self.app_url, PASSWORD_RECOVERY_ROUTE, &reset.token);
        self.mailer
            .send(mailer::password_recovery_mail(email, &user.username, &link))
            .await?;

        info!(user_id = user.id, "password reset mail sent");
        Ok(())
    }

    /// Rehashes with the salt stored at registration.
    pub async fn change_password(&self, user_id: i64, new_password: &str) -> Result<(), FlowError> {
        require_non_empty("newPw", new_password)?;

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(FlowError::UnknownUser)?;
        let salt = Salt::from_base64(&user.salt)?;
        let hash = self
            .hasher
            .clone()
            .derive_blocking(new_password.to_string(), salt)
            .await?;
        self.store
            .update_password_hash(user.id, &hash.to_base64())
            .await?;

        info!(user_id = user.id, "password changed");
        Ok(())
    }

    pub async fn rename_user(&self, user_id: i64, name: &str) -> Result<(), FlowError> {
        require_non_empty("name", name)?;
        self.store.update_username(user_id, name).await?;
        info!(user_id, username = %name, "username changed");
        Ok(())
    }

    pub async fn set_active(&self, user_id: i64, active: bool) -> Result<(), FlowError> {
        self.store.update_active_flag(user_id, active).await?;
        info!(user_id, active, "active flag updated");
        Ok(())
    }

    pub async fn set_groups(&self, user_id: i64, groups: &[String]) -> Result<(), FlowError> {
        let mut groups = groups
            .iter()
            .map(|group| group.trim().to_string())
            .filter(|group| !group.is_empty())
            .collect::<Vec<_>>();
        groups.sort();
        groups.dedup();
        self.store.update_groups(user_id, &groups).await?;
        info!(user_id, ?groups, "group memberships updated");
        Ok(())
    }

    /// Self updates may change the name and password; anything touching another
    /// account, or the active flag and groups, requires the admin role.
    /// The rename runs first so a taken name leaves the account untouched.
    pub async fn update_user(
        &self,
        caller: &Principal,
        target_id: i64,
        update: UserUpdate,
    ) -> Result<UserRecord, FlowError> {
        let is_self = caller.id == target_id;
        if !is_self || update.active.is_some() || update.groups.is_some() {
            ensure_role(caller, ROLE_ADMIN)?;
        }

        if update.new_password.is_some() && !is_self {
            return Err(FlowError::Validation(
                "newPw can only be set by the account owner".to_string(),
            ));
        }
        if let Some(name) = &update.name {
            require_non_empty("name", name)?;
        }
        if let Some(new_password) = &update.new_password {
            require_non_empty("newPw", new_password)?;
        }

        if let Some(name) = &update.name {
            self.rename_user(target_id, name).await?;
        }
        if let Some(new_password) = &update.new_password {
            self.change_password(target_id, new_password).await?;
        }
        if let Some(active) = update.active {
            self.set_active(target_id, active).await?;
        }
        if let Some(groups) = &update.groups {
            self.set_groups(target_id, groups).await?;
        }

        self.store
            .find_by_id(target_id)
            .await?
            .ok_or(FlowError::UnknownUser)
    }

    /// Group memberships are only visible to admins.
    pub async fn list_users(&self, caller: &Principal) -> Result<Vec<UserRecord>, FlowError> {
        let mut users = self.store.list_users().await?;
        if !caller.has_role(ROLE_ADMIN) {
            for user in &mut users {
                user.groups.clear();
            }
        }
        Ok(users)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), FlowError> {
    if value.trim().is_empty() {
        return Err(FlowError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_email(value: &str) -> Result<(), FlowError> {
    let trimmed = value.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(FlowError::Validation("email is not a valid address".to_string())),
    }
}
