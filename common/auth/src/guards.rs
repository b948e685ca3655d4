use tracing::warn;

use crate::claims::Principal;
use crate::error::AuthError;

/// Single role check used by the role gate and by handlers with role-dependent branches.
pub fn ensure_role(principal: &Principal, required: &str) -> Result<(), AuthError> {
    if principal.has_role(required) {
        return Ok(());
    }

    warn!(
        user_id = principal.id,
        required,
        groups = ?principal.groups,
        "role_check_failed"
    );
    Err(AuthError::Forbidden {
        role: required.to_string(),
    })
}
