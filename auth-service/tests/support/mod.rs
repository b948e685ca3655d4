#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use common_auth::{JwtConfig, ManualClock, TokenService};
use dirs::cache_dir;
use http_body_util::BodyExt;
use pg_embed::pg_enums::PgAuthMethod;
use pg_embed::pg_fetch::{PgFetchSettings, PG_V13};
use pg_embed::postgres::{PgEmbed, PgSettings};
use portpicker::pick_unused_port;
use quiz_auth_service::flows::CredentialFlows;
use quiz_auth_service::mailer::{MailError, Mailer, OutgoingMail};
use quiz_auth_service::metrics::AuthMetrics;
use quiz_auth_service::password::{KdfParams, PasswordHasher};
use quiz_auth_service::store::{NewUserRecord, StoreError, UserRecord, UserStore};
use quiz_auth_service::{build_router, AppState};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;

pub const TEST_SECRET: &[u8] = b"quiz-auth-integration-test-secret-0123456789";
pub const APP_URL: &str = "https://quiz.test/";

#[derive(Default)]
struct StoreState {
    next_id: i64,
    users: BTreeMap<i64, UserRecord>,
}

/// `UserStore` kept in memory with the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct InMemoryUserStore {
    state: Mutex<StoreState>,
}

impl InMemoryUserStore {
    pub fn get(&self, id: i64) -> Option<UserRecord> {
        self.state.lock().unwrap().users.get(&id).cloned()
    }

    pub fn by_name(&self, username: &str) -> Option<UserRecord> {
        self.state
            .lock()
            .unwrap()
            .users
            .values()
            .find(|user| user.username == username)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }
}

fn normalized(groups: &[String]) -> Vec<String> {
    let mut groups = groups.to_vec();
    groups.sort();
    groups.dedup();
    groups
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.by_name(username))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.get(id))
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.by_name(username).is_some())
    }

    async fn insert(&self, user: NewUserRecord) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Duplicate(user.username));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.users.insert(
            id,
            UserRecord {
                id,
                username: user.username,
                salt: user.salt,
                password_hash: user.password_hash,
                mail_hash: user.mail_hash,
                active: user.active,
                groups: normalized(&user.groups),
            },
        );
        Ok(id)
    }

    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn update_username(&self, id: i64, username: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .users
            .values()
            .any(|u| u.username == username && u.id != id)
        {
            return Err(StoreError::Duplicate(username.to_string()));
        }
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        user.username = username.to_string();
        Ok(())
    }

    async fn update_groups(&self, id: i64, groups: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        user.groups = normalized(groups);
        Ok(())
    }

    async fn update_active_flag(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        user.active = active;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.state.lock().unwrap().users.values().cloned().collect())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<OutgoingMail> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError::Delivery("relay unavailable".into()));
        }
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Cheap KDF cost so the suite stays fast.
pub fn test_hasher() -> PasswordHasher {
    PasswordHasher::new(KdfParams {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    })
    .expect("valid test params")
}

/// Token embedded at the end of a mailed link.
pub fn token_from_mail(mail: &OutgoingMail) -> Result<String> {
    mail.body
        .lines()
        .find(|line| line.starts_with(APP_URL))
        .and_then(|line| line.rsplit('/').next())
        .map(|token| token.trim().to_string())
        .ok_or_else(|| anyhow!("no link in mail body: {}", mail.body))
}

pub struct TestResponse {
    pub status: StatusCode,
    pub error_code: Option<String>,
    pub body: Value,
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryUserStore>,
    pub mailer: Arc<RecordingMailer>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<TokenService>,
    pub flows: Arc<CredentialFlows>,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryUserStore::default());
        let mailer = Arc::new(RecordingMailer::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let tokens = Arc::new(TokenService::with_clock(
            JwtConfig::new(TEST_SECRET.to_vec()),
            clock.clone(),
        ));
        let flows = Arc::new(CredentialFlows::new(
            store.clone(),
            mailer.clone(),
            Arc::new(test_hasher()),
            tokens.clone(),
            APP_URL,
        ));
        let metrics = Arc::new(AuthMetrics::new().expect("metrics registry"));
        let router = build_router(AppState::new(flows.clone(), metrics));

        Self {
            router,
            store,
            mailer,
            clock,
            tokens,
            flows,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Result<TestResponse> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Result<TestResponse> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let error_code = response
            .headers()
            .get("x-error-code")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.into_body().collect().await?.to_bytes();
        // Plain-text bodies (healthz, metrics) come back as a JSON string.
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(TestResponse {
            status,
            error_code,
            body,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<TestResponse> {
        self.call(
            Method::POST,
            "/login",
            Some(json!({ "username": username, "password": password })),
            None,
        )
        .await
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<TestResponse> {
        self.call(
            Method::POST,
            "/newusers",
            Some(json!({
                "newuser": { "username": username, "password": password, "email": email }
            })),
            None,
        )
        .await
    }

    /// Registers and confirms through the mailed link; returns the new id.
    pub async fn register_active(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<i64> {
        let response = self.register(username, password, email).await?;
        if response.status != StatusCode::CREATED {
            return Err(anyhow!("registration failed: {}", response.status));
        }
        let mail = self.mailer.last().context("confirmation mail")?;
        let token = token_from_mail(&mail)?;
        let confirmed = self
            .call(Method::POST, "/confirmations", Some(json!({ "token": token })), None)
            .await?;
        if confirmed.status != StatusCode::OK {
            return Err(anyhow!("confirmation failed: {}", confirmed.status));
        }
        self.store
            .by_name(username)
            .map(|user| user.id)
            .context("registered user missing from store")
    }

    /// Active account holding the admin group; returns (id, session token).
    pub async fn admin(&self) -> Result<(i64, String)> {
        let id = self.register_active("root", "admin-pw", "root@quiz.test").await?;
        self.store
            .update_groups(id, &["admin".to_string(), "student".to_string()])
            .await?;
        let response = self.login("root", "admin-pw").await?;
        let token = response.body["token"]
            .as_str()
            .context("admin token")?
            .to_string();
        Ok((id, token))
    }

    pub async fn session_token(&self, username: &str, password: &str) -> Result<String> {
        let response = self.login(username, password).await?;
        response.body["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("login failed with {}: {}", response.status, response.body))
    }
}

pub struct TestDatabase {
    pool: PgPool,
    embedded: Option<EmbeddedPg>,
}

impl TestDatabase {
    pub async fn setup() -> Result<Option<Self>> {
        if env::var("AUTH_TEST_DATABASE_URL").is_err() && !env_flag_enabled("AUTH_TEST_USE_EMBED") {
            eprintln!(
                "Skipping quiz-auth-service Postgres tests: set AUTH_TEST_DATABASE_URL or AUTH_TEST_USE_EMBED=1 to run them.",
            );
            return Ok(None);
        }

        let mut embedded = None;
        let database_url = if let Ok(url) = env::var("AUTH_TEST_DATABASE_URL") {
            url
        } else {
            if env_flag_enabled("AUTH_TEST_EMBED_CLEAR_CACHE") {
                if let Some(cache_dir) = cache_dir() {
                    let _ = std::fs::remove_dir_all(cache_dir.join("pg-embed"));
                }
            }

            let temp = tempdir()?;
            let port = pick_unused_port()
                .context("failed to find available port for embedded Postgres")?;

            let mut fetch_settings = PgFetchSettings::default();
            fetch_settings.version = PG_V13;

            let mut pg = PgEmbed::new(
                PgSettings {
                    database_dir: temp.path().to_path_buf(),
                    port,
                    user: "postgres".to_string(),
                    password: "postgres".to_string(),
                    auth_method: PgAuthMethod::Plain,
                    persistent: false,
                    timeout: Some(Duration::from_secs(30)),
                    migration_dir: None,
                },
                fetch_settings,
            )
            .await?;

            pg.setup().await?;
            pg.start_db().await?;

            let uri = format!("{}/postgres", pg.db_uri);
            embedded = Some(EmbeddedPg {
                pg,
                _temp_dir: temp,
            });
            uri
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        if embedded.is_some() || env_flag_enabled("AUTH_TEST_APPLY_MIGRATIONS") {
            run_migrations(&pool).await?;
        }

        Ok(Some(Self { pool, embedded }))
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn teardown(self) -> Result<()> {
        if let Some(embedded) = self.embedded {
            embedded.shutdown().await;
        }
        Ok(())
    }
}

struct EmbeddedPg {
    pg: PgEmbed,
    _temp_dir: TempDir,
}

impl EmbeddedPg {
    async fn shutdown(mut self) {
        let _ = self.pg.stop_db().await;
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut entries = std::fs::read_dir(&migrations_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        let sql = std::fs::read_to_string(&path)?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    Ok(())
}

fn env_flag_enabled(key: &str) -> bool {
    matches!(env::var(key), Ok(value) if is_truthy(value.as_str()))
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}
