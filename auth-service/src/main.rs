use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use common_auth::TokenService;
use quiz_auth_service::config::load_service_config;
use quiz_auth_service::flows::CredentialFlows;
use quiz_auth_service::mailer::SmtpMailer;
use quiz_auth_service::metrics::AuthMetrics;
use quiz_auth_service::password::{KdfParams, PasswordHasher};
use quiz_auth_service::store::PgUserStore;
use quiz_auth_service::{build_router, AppState};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEV_ORIGINS: [&str; 3] = [
    "http://localhost:3000",
    "http://localhost:3001",
    "http://localhost:5173",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_service_config()?;
    info!(
        app_url = %config.app_url,
        smtp = ?config.smtp,
        jwt = ?config.jwt,
        "loaded configuration"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply migrations")?;
    }

    let hasher = PasswordHasher::new(KdfParams::default())
        .map_err(|err| anyhow!("invalid KDF parameters: {err}"))?;
    let mailer = SmtpMailer::new(&config.smtp)
        .map_err(|err| anyhow!("failed to configure SMTP transport: {err}"))?;
    let tokens = Arc::new(TokenService::new(config.jwt.clone()));

    let flows = CredentialFlows::new(
        Arc::new(PgUserStore::new(pool)),
        Arc::new(mailer),
        Arc::new(hasher),
        tokens,
        config.app_url.clone(),
    );
    let metrics = AuthMetrics::new()?;
    let state = AppState::new(Arc::new(flows), Arc::new(metrics));

    let origins = if config.allowed_origins.is_empty() {
        DEV_ORIGINS.iter().map(|origin| origin.to_string()).collect()
    } else {
        config.allowed_origins.clone()
    };
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION]);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!(addr = %config.bind_addr, "starting quiz-auth-service");
    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
