use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, SecretString};

use crate::crypto::random_from_alphabet;
use crate::models::PasswordRequirements;

/// Length of generated one-time passwords.
pub const ONE_TIME_PASSWORD_LEN: usize = 12;

const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+";

/// A plaintext password. Never printed.
pub struct Password(SecretString);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(SecretString::new(password.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

/// Hash with Argon2id and a random salt. The whole input is hashed, however
/// long it is.
pub fn hash_password(password: &Password) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.expose().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?
        .to_string();
    Ok(hash)
}

/// `true` when `password` matches `hash`. A malformed hash never matches.
pub fn verify_password(password: &Password, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.expose().as_bytes(), &parsed)
        .is_ok()
}

pub fn generate_one_time_password() -> Password {
    Password::new(random_from_alphabet(ONE_TIME_PASSWORD_LEN, PASSWORD_ALPHABET))
}

// OWASP password special characters
fn is_symbol(c: char) -> bool {
    matches!(c, '\u{20}'..='\u{2F}' | '\u{3A}'..='\u{40}' | '\u{5B}'..='\u{60}' | '\u{7B}'..='\u{7E}')
}

fn plural(count: i32, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Check `password` against the organization's minimums. On failure returns
/// every active requirement, so the caller can show the whole policy.
pub fn check_password_requirements(
    password: &Password,
    req: &PasswordRequirements,
) -> Result<(), Vec<String>> {
    let password = password.expose();
    let rules: [(i32, fn(char) -> bool, &str); 5] = [
        (req.length_min, |_| true, "character"),
        (req.lowercase_min, char::is_lowercase, "lowercase letter"),
        (req.uppercase_min, char::is_uppercase, "uppercase letter"),
        (req.number_min, |c| c.is_ascii_digit(), "number"),
        (req.symbol_min, is_symbol, "symbol"),
    ];

    let mut valid = true;
    let mut messages = Vec::new();
    for (min, matches, noun) in rules {
        let count = password.chars().filter(|c| matches(*c)).count();
        if (count as i64) < i64::from(min) {
            valid = false;
        }
        if min > 0 {
            messages.push(plural(min, noun));
        }
    }

    if valid {
        Ok(())
    } else {
        Err(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_and_is_salted() {
        let password = Password::new("mySecurePassword123");
        let first = hash_password(&password).unwrap();
        let second = hash_password(&password).unwrap();

        assert!(first.starts_with("$argon2id"));
        assert_ne!(first, second);
        assert!(verify_password(&password, &first));
        assert!(!verify_password(&Password::new("wrong"), &first));
    }

    #[test]
    fn long_passwords_are_not_truncated() {
        let long = "a".repeat(100);
        let hash = hash_password(&Password::new(long.clone())).unwrap();
        assert!(verify_password(&Password::new(long.clone()), &hash));
        assert!(!verify_password(&Password::new(&long[..72]), &hash));
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!verify_password(&Password::new("x"), "not-a-hash"));
    }

    #[test]
    fn debug_redacts() {
        assert!(!format!("{:?}", Password::new("hunter2")).contains("hunter2"));
    }

    #[test]
    fn one_time_password_shape() {
        let p = generate_one_time_password();
        assert_eq!(p.expose().len(), ONE_TIME_PASSWORD_LEN);
    }

    #[test]
    fn default_requirements_only_check_length() {
        let req = PasswordRequirements::default();
        assert!(check_password_requirements(&Password::new("abcdefgh"), &req).is_ok());
        assert_eq!(
            check_password_requirements(&Password::new("short"), &req).unwrap_err(),
            vec!["8 characters".to_string()]
        );
    }

    #[test]
    fn every_requirement_is_reported() {
        let req = PasswordRequirements {
            length_min: 10,
            lowercase_min: 1,
            uppercase_min: 2,
            number_min: 1,
            symbol_min: 1,
        };
        let err = check_password_requirements(&Password::new("abcdefghij"), &req).unwrap_err();
        assert_eq!(
            err,
            vec![
                "10 characters",
                "1 lowercase letter",
                "2 uppercase letters",
                "1 number",
                "1 symbol"
            ]
        );
        assert!(check_password_requirements(&Password::new("abcdEFgh1!xy"), &req).is_ok());
    }
}
