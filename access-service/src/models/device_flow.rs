use chrono::{DateTime, Utc};
use service_core::uid::Id;
use sqlx::FromRow;

/// Consonants only, so codes read aloud or typed from a screen are unambiguous.
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
pub const USER_CODE_LEN: usize = 8;
pub const DEVICE_CODE_LEN: usize = 38;

#[derive(Debug, Clone, FromRow)]
pub struct DeviceFlowAuthRequest {
    pub id: Id,
    pub organization_id: Id,
    pub user_code: String,
    pub device_code: String,
    pub approved: bool,
    pub access_key_id: Id,
    /// Sealed in the database, plain here.
    pub access_key_token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn is_valid_user_code(code: &str) -> bool {
    code.len() == USER_CODE_LEN && code.bytes().all(|b| USER_CODE_ALPHABET.contains(&b))
}

pub fn is_valid_device_code(code: &str) -> bool {
    code.len() == DEVICE_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_code_rejects_ambiguous_glyphs() {
        assert!(is_valid_user_code("BCDFGHJK"));
        for bad in ["BCDFGHJ0", "BCDFGHJO", "BCDFGHJ1", "BCDFGHJI", "BCDFGHJA", "BCDFGHJ"] {
            assert!(!is_valid_user_code(bad), "{bad}");
        }
    }

    #[test]
    fn device_code_is_38_alphanumerics() {
        assert!(is_valid_device_code(&"a".repeat(38)));
        assert!(!is_valid_device_code(&"a".repeat(37)));
        assert!(!is_valid_device_code(&format!("{}-", "a".repeat(37))));
    }
}
