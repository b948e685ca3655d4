use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

use crate::claims::{Principal, SessionClaims, TokenPurpose};
use crate::clock::{Clock, SystemClock};
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: &'static str,
}

/// Issues and verifies HS256 session tokens with a single shared key.
///
/// Both operations are pure functions of the payload, the key and the clock,
/// so one instance is shared across all requests without locking.
pub struct TokenService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(config: JwtConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: JwtConfig, clock: Arc<dyn Clock>) -> Self {
        let encoding_key = EncodingKey::from_secret(&config.signing_secret);
        let decoding_key = DecodingKey::from_secret(&config.signing_secret);

        // exp is checked against the injected clock in `verify`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            config,
            encoding_key,
            decoding_key,
            validation,
            clock,
        }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Issue a session token valid for `ttl`.
    pub fn issue(&self, principal: &Principal, ttl: Duration) -> AuthResult<IssuedToken> {
        self.sign(SessionClaims::for_principal(principal, self.expiry(ttl)?))
    }

    /// Issue a token with the configured session lifetime.
    pub fn issue_session(&self, principal: &Principal) -> AuthResult<IssuedToken> {
        self.issue(principal, self.config.session_ttl)
    }

    /// Issue the short-lived token embedded in registration and password-reset mails.
    /// It carries `purpose` and is refused wherever a session is expected.
    pub fn issue_mail_token(
        &self,
        principal: &Principal,
        purpose: TokenPurpose,
    ) -> AuthResult<IssuedToken> {
        let expires_at = self.expiry(self.config.confirmation_ttl)?;
        self.sign(SessionClaims::for_principal(principal, expires_at).with_purpose(purpose))
    }

    /// Verify a session token. Mailed tokens are rejected.
    pub fn verify(&self, token: &str) -> AuthResult<SessionClaims> {
        let claims = self.decode_unexpired(token)?;
        if let Some(purpose) = claims.purpose {
            debug!(uid = claims.uid, ?purpose, "rejected mailed token used as session");
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    /// Verify a mailed token issued for exactly `purpose`.
    pub fn verify_purpose(&self, token: &str, purpose: TokenPurpose) -> AuthResult<SessionClaims> {
        let claims = self.decode_unexpired(token)?;
        if claims.purpose != Some(purpose) {
            debug!(
                uid = claims.uid,
                expected = ?purpose,
                found = ?claims.purpose,
                "rejected token with wrong purpose"
            );
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    fn expiry(&self, ttl: Duration) -> AuthResult<DateTime<Utc>> {
        if ttl < Duration::seconds(1) {
            return Err(AuthError::Signing(format!(
                "token lifetime must be at least one second, got {ttl}"
            )));
        }
        Ok(self.clock.now() + ttl)
    }

    fn sign(&self, claims: SessionClaims) -> AuthResult<IssuedToken> {
        let expires_at = claims
            .expires_at()
            .ok_or_else(|| AuthError::Signing(format!("expiry out of range: {}", claims.exp)))?;

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::Signing(err.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_at,
            token_type: "Bearer",
        })
    }

    fn decode_unexpired(&self, token: &str) -> AuthResult<SessionClaims> {
        let token_data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| {
                debug!(error = %err, "rejected token");
                AuthError::InvalidToken
            })?;
        let claims = token_data.claims;

        let cutoff = self.clock.now().timestamp() - i64::from(self.config.leeway_seconds);
        if claims.exp <= cutoff {
            debug!(uid = claims.uid, exp = claims.exp, "rejected expired token");
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }

    pub fn verify_principal(&self, token: &str) -> AuthResult<Principal> {
        self.verify(token).map(Principal::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::json;

    const SECRET: &[u8] = b"test-signing-secret-with-enough-bytes";

    fn service_with_clock() -> (TokenService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let service = TokenService::with_clock(JwtConfig::new(SECRET), clock.clone());
        (service, clock)
    }

    fn alice() -> Principal {
        Principal::new(7, "alice", ["student", "editor"])
    }

    fn sign_raw(payload: &serde_json::Value, secret: &[u8]) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            payload,
            &EncodingKey::from_secret(secret),
        )
        .expect("sign raw payload")
    }

    #[test]
    fn verify_returns_issued_claims() {
        let (service, _) = service_with_clock();
        for ttl in [Duration::seconds(1), Duration::minutes(5), Duration::hours(12)] {
            let issued = service.issue(&alice(), ttl).expect("issue");
            let claims = service.verify(&issued.token).expect("verify");
            assert_eq!(claims.uid, 7);
            assert_eq!(claims.name, "alice");
            assert_eq!(claims.exp, issued.expires_at.timestamp());
            assert_eq!(claims.into_principal(), alice());
        }
    }

    #[test]
    fn token_has_three_base64url_segments() {
        let (service, _) = service_with_clock();
        let issued = service.issue_session(&alice()).expect("issue");
        let segments = issued.token.split('.').collect::<Vec<_>>();
        assert_eq!(segments.len(), 3);
        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "HS256");
        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap()).unwrap();
        for claim in ["uid", "name", "groups", "exp"] {
            assert!(payload.get(claim).is_some(), "missing claim {claim}");
        }
    }

    #[test]
    fn verify_fails_once_ttl_elapsed() {
        let (service, clock) = service_with_clock();
        let ttl = Duration::minutes(10);
        let issued = service.issue(&alice(), ttl).expect("issue");

        clock.advance(ttl - Duration::seconds(1));
        assert!(service.verify(&issued.token).is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(
            service.verify(&issued.token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn leeway_extends_acceptance_window() {
        let clock = Arc::new(ManualClock::default());
        let service =
            TokenService::with_clock(JwtConfig::new(SECRET).with_leeway(30), clock.clone());
        let issued = service.issue(&alice(), Duration::seconds(60)).expect("issue");

        clock.advance(Duration::seconds(80));
        assert!(service.verify(&issued.token).is_ok());
        clock.advance(Duration::seconds(10));
        assert!(service.verify(&issued.token).is_err());
    }

    #[test]
    fn flipping_any_byte_invalidates_token() {
        let (service, _) = service_with_clock();
        let issued = service.issue_session(&alice()).expect("issue");
        let original = issued.token.into_bytes();

        for index in 0..original.len() {
            let mut tampered = original.clone();
            tampered[index] ^= 0x01;
            let tampered = String::from_utf8(tampered).expect("ascii stays ascii");
            assert!(
                service.verify(&tampered).is_err(),
                "tampering byte {index} was not detected"
            );
        }
    }

    #[test]
    fn token_signed_with_other_key_is_rejected() {
        let (service, _) = service_with_clock();
        let other = TokenService::new(JwtConfig::new(
            b"a-completely-different-signing-key".to_vec(),
        ));
        let issued = other.issue_session(&alice()).expect("issue");
        assert!(matches!(
            service.verify(&issued.token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn swapped_payload_is_rejected() {
        let (service, clock) = service_with_clock();
        let issued = service.issue_session(&alice()).expect("issue");
        let segments = issued.token.split('.').collect::<Vec<_>>();

        let forged = json!({
            "uid": 1,
            "name": "root",
            "groups": ["admin"],
            "exp": clock.now().timestamp() + 3600,
        });
        let forged_payload = URL_SAFE_NO_PAD.encode(forged.to_string());
        let forged_token = format!("{}.{}.{}", segments[0], forged_payload, segments[2]);
        assert!(service.verify(&forged_token).is_err());
    }

    #[test]
    fn non_numeric_subject_is_rejected_like_bad_signature() {
        let (service, clock) = service_with_clock();
        let token = sign_raw(
            &json!({
                "uid": "7",
                "name": "alice",
                "groups": [],
                "exp": clock.now().timestamp() + 3600,
            }),
            SECRET,
        );
        assert!(matches!(service.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn missing_claim_is_rejected() {
        let (service, clock) = service_with_clock();
        let token = sign_raw(
            &json!({ "uid": 7, "name": "alice", "exp": clock.now().timestamp() + 3600 }),
            SECRET,
        );
        assert!(matches!(service.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let (service, clock) = service_with_clock();
        let claims = SessionClaims::for_principal(&alice(), clock.now() + Duration::hours(1));
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .expect("sign");
        assert!(matches!(service.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn garbage_is_rejected() {
        let (service, _) = service_with_clock();
        for token in ["", "abc", "a.b.c", "....", "eyJhbGciOiJub25lIn0.e30."] {
            assert!(matches!(service.verify(token), Err(AuthError::InvalidToken)));
        }
    }

    #[test]
    fn sub_second_ttl_is_refused() {
        let (service, _) = service_with_clock();
        assert!(matches!(
            service.issue(&alice(), Duration::zero()),
            Err(AuthError::Signing(_))
        ));
        assert!(matches!(
            service.issue(&alice(), Duration::milliseconds(500)),
            Err(AuthError::Signing(_))
        ));
    }

    #[test]
    fn mail_tokens_use_configured_ttl() {
        let clock = Arc::new(ManualClock::default());
        let config = JwtConfig::new(SECRET).with_confirmation_ttl(Duration::minutes(30));
        let service = TokenService::with_clock(config, clock.clone());
        let issued = service
            .issue_mail_token(&alice(), TokenPurpose::ConfirmMail)
            .expect("issue");
        assert_eq!(
            issued.expires_at.timestamp(),
            clock.now().timestamp() + 30 * 60
        );
    }

    #[test]
    fn mail_tokens_are_not_sessions() {
        let (service, _) = service_with_clock();
        for purpose in [TokenPurpose::ConfirmMail, TokenPurpose::PasswordRecovery] {
            let issued = service.issue_mail_token(&alice(), purpose).expect("issue");
            assert!(matches!(service.verify(&issued.token), Err(AuthError::InvalidToken)));
            assert!(service.verify_principal(&issued.token).is_err());
            let claims = service
                .verify_purpose(&issued.token, purpose)
                .expect("verify purpose");
            assert_eq!(claims.purpose, Some(purpose));
        }
    }

    #[test]
    fn purpose_must_match_exactly() {
        let (service, _) = service_with_clock();
        let session = service.issue_session(&alice()).expect("issue");
        let recovery = service
            .issue_mail_token(&alice(), TokenPurpose::PasswordRecovery)
            .expect("issue");

        assert!(service
            .verify_purpose(&session.token, TokenPurpose::ConfirmMail)
            .is_err());
        assert!(service
            .verify_purpose(&recovery.token, TokenPurpose::ConfirmMail)
            .is_err());
    }

    #[test]
    fn expired_mail_token_is_rejected() {
        let (service, clock) = service_with_clock();
        let issued = service
            .issue_mail_token(&alice(), TokenPurpose::ConfirmMail)
            .expect("issue");
        clock.advance(service.config().confirmation_ttl);
        assert!(service
            .verify_purpose(&issued.token, TokenPurpose::ConfirmMail)
            .is_err());
    }
}
