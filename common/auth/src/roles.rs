pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_STUDENT: &str = "student";

/// Role granted to every newly registered account.
pub const DEFAULT_ROLE: &str = ROLE_STUDENT;
