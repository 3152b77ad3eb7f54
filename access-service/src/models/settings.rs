use service_core::uid::Id;
use sqlx::FromRow;

/// Per-organization signing key and password policy. `private_jwk` is plain
/// here and sealed in the table.
#[derive(Debug, Clone, FromRow)]
pub struct Settings {
    pub id: Id,
    pub organization_id: Id,
    pub private_jwk: String,
    pub public_jwk: String,
    #[sqlx(flatten)]
    pub password: PasswordRequirements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct PasswordRequirements {
    pub length_min: i32,
    pub lowercase_min: i32,
    pub uppercase_min: i32,
    pub number_min: i32,
    pub symbol_min: i32,
}

impl Default for PasswordRequirements {
    fn default() -> Self {
        Self {
            length_min: 8,
            lowercase_min: 0,
            uppercase_min: 0,
            number_min: 0,
            symbol_min: 0,
        }
    }
}
