pub mod app;
pub mod config;
pub mod flows;
pub mod mailer;
pub mod metrics;
pub mod password;
pub mod store;
pub mod user_handlers;

pub use app::{build_router, AppState};
