use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// What a mailed token may be used for. Session tokens carry no purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenPurpose {
    ConfirmMail,
    PasswordRecovery,
}

/// Wire representation of the signed token payload.
///
/// Field names are part of the client contract. Deserialisation is strict:
/// a missing field or a type mismatch (for example a string or fractional `uid`)
/// rejects the whole token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub uid: i64,
    pub name: String,
    pub groups: Vec<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<TokenPurpose>,
}

impl SessionClaims {
    pub fn for_principal(principal: &Principal, expires_at: DateTime<Utc>) -> Self {
        Self {
            uid: principal.id,
            name: principal.name.clone(),
            groups: principal.groups.iter().cloned().collect(),
            exp: expires_at.timestamp(),
            purpose: None,
        }
    }

    pub fn with_purpose(mut self, purpose: TokenPurpose) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    pub fn into_principal(self) -> Principal {
        Principal::from(self)
    }
}

/// Authenticated identity reconstructed from a verified token for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: i64,
    pub name: String,
    pub groups: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, G>(id: i64, name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<String>,
    {
        Self {
            id,
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Convenience helper for role checks.
    pub fn has_role(&self, role: &str) -> bool {
        self.groups.contains(role)
    }
}

impl From<SessionClaims> for Principal {
    fn from(value: SessionClaims) -> Self {
        Self {
            id: value.uid,
            name: value.name,
            groups: value.groups.into_iter().collect(),
        }
    }
}
