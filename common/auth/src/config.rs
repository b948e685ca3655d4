use std::fmt;

use chrono::Duration;

/// Runtime configuration for session token signing and verification.
#[derive(Clone)]
pub struct JwtConfig {
    /// Shared HMAC-SHA256 key. Read-only after startup.
    pub signing_secret: Vec<u8>,
    /// Lifetime of session tokens minted at login/confirmation.
    pub session_ttl: Duration,
    /// Lifetime of tokens embedded in registration and reset mails.
    pub confirmation_ttl: Duration,
    /// Allowable clock skew in seconds when validating exp.
    pub leeway_seconds: u32,
}

impl JwtConfig {
    /// Construct config with the default lifetimes (12h sessions, 2h mailed tokens, no leeway).
    pub fn new(signing_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            session_ttl: Duration::hours(12),
            confirmation_ttl: Duration::hours(2),
            leeway_seconds: 0,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_confirmation_ttl(mut self, ttl: Duration) -> Self {
        self.confirmation_ttl = ttl;
        self
    }

    /// Adjust the allowed leeway.
    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("signing_secret", &"<redacted>")
            .field("session_ttl", &self.session_ttl)
            .field("confirmation_ttl", &self.confirmation_ttl)
            .field("leeway_seconds", &self.leeway_seconds)
            .finish()
    }
}
