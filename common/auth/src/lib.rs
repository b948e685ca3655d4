pub mod claims;
pub mod clock;
pub mod config;
pub mod error;
pub mod extractors;
pub mod gates;
pub mod guards;
pub mod roles;
pub mod tokens;

pub use claims::{Principal, SessionClaims, TokenPurpose};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult, AUTHENTICATION_FAILED};
pub use extractors::{extract_principal, parse_bearer, AuthContext, MaybeAuthContext};
pub use gates::{run_gate, Gate, GateExt, GateKind};
pub use guards::ensure_role;
pub use roles::{DEFAULT_ROLE, ROLE_ADMIN, ROLE_STUDENT};
pub use tokens::{IssuedToken, TokenService};
