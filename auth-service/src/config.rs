use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use common_auth::JwtConfig;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

const MIN_SECRET_BYTES: usize = 32;
const DEFAULT_PORT: u16 = 8085;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_CONFIRMATION_TTL_SECONDS: i64 = 2 * 60 * 60;

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub jwt: JwtConfig,
    /// Base URL of the web client; always ends with `/`.
    pub app_url: String,
    pub smtp: SmtpConfig,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

pub fn load_service_config() -> Result<ServiceConfig> {
    let database_url = required_env("DATABASE_URL")?;

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = parse_from_env::<u16>("PORT")?.unwrap_or(DEFAULT_PORT);
    let ip: IpAddr = host
        .trim()
        .parse()
        .with_context(|| format!("Invalid HOST '{host}'"))?;

    let secret = required_env("JWT_SECRET")?;
    if secret.as_bytes().len() < MIN_SECRET_BYTES {
        return Err(anyhow!(
            "JWT_SECRET must be at least {MIN_SECRET_BYTES} bytes long"
        ));
    }
    let session_ttl = parse_from_env::<i64>("SESSION_TTL_SECONDS")?
        .unwrap_or(DEFAULT_SESSION_TTL_SECONDS);
    let confirmation_ttl = parse_from_env::<i64>("CONFIRMATION_TTL_SECONDS")?
        .unwrap_or(DEFAULT_CONFIRMATION_TTL_SECONDS);
    if session_ttl < 1 || confirmation_ttl < 1 {
        return Err(anyhow!("token lifetimes must be at least one second"));
    }
    let leeway = parse_from_env::<u32>("JWT_LEEWAY_SECONDS")?.unwrap_or(0);
    let jwt = JwtConfig::new(secret.into_bytes())
        .with_session_ttl(Duration::seconds(session_ttl))
        .with_confirmation_ttl(Duration::seconds(confirmation_ttl))
        .with_leeway(leeway);

    let app_url = normalize_app_url(&required_env("APP_URL")?);

    let smtp = SmtpConfig {
        host: required_env("SMTP_HOST")?,
        port: parse_from_env::<u16>("SMTP_PORT")?.unwrap_or(DEFAULT_SMTP_PORT),
        username: env::var("SMTP_USERNAME")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        password: env::var("SMTP_PASSWORD")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        from: required_env("MAIL_FROM")?,
    };

    let allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
        .ok()
        .map(|value| parse_origins(&value))
        .unwrap_or_default();

    let run_migrations = bool_from_env("RUN_MIGRATIONS").unwrap_or(true);

    Ok(ServiceConfig {
        database_url,
        bind_addr: SocketAddr::from((ip, port)),
        jwt,
        app_url,
        smtp,
        allowed_origins,
        run_migrations,
    })
}

fn required_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .and_then(|value| normalize_optional(&value))
        .ok_or_else(|| anyhow!("{key} must be set"))
}

fn parse_from_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key).ok().and_then(|value| normalize_optional(&value)) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Failed to parse {key}='{value}'")),
        None => Ok(None),
    }
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';' || c == ' ')
        .filter_map(normalize_optional)
        .collect()
}

fn normalize_app_url(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
