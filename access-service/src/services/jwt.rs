use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use rand::rngs::OsRng;
use service_core::api::{Jwk, TokenClaims};
use service_core::error::AppError;

use crate::crypto::random_alphanumeric;

/// Lifetime of a token issued by `CreateToken`.
pub const TOKEN_LIFETIME_MINUTES: i64 = 5;
/// `nbf` is backdated by this much to absorb clock skew.
const NOT_BEFORE_SKEW_MINUTES: i64 = 5;

/// Generate an Ed25519 signing key as a private JWK.
pub fn generate_signing_jwk() -> Jwk {
    let signing_key = SigningKey::generate(&mut OsRng);
    Jwk {
        kty: "OKP".to_string(),
        crv: "Ed25519".to_string(),
        x: URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes()),
        d: Some(URL_SAFE_NO_PAD.encode(signing_key.to_bytes())),
        kid: random_alphanumeric(16),
        alg: "EdDSA".to_string(),
        use_: "sig".to_string(),
    }
}

fn encoding_key(private: &Jwk) -> Result<EncodingKey, AppError> {
    let d = private
        .d
        .as_deref()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("signing key has no private half")))?;
    let bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(d)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("decoding signing key: {}", e)))?
        .try_into()
        .map_err(|_| AppError::InternalError(anyhow::anyhow!("signing key has the wrong length")))?;
    let der = SigningKey::from_bytes(&bytes)
        .to_pkcs8_der()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("encoding signing key: {}", e)))?;
    Ok(EncodingKey::from_ed_der(der.as_bytes()))
}

/// Sign a short-lived identity token for `name`.
pub fn issue_token(
    private: &Jwk,
    name: &str,
    groups: Vec<String>,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>), AppError> {
    let expires = now + Duration::minutes(TOKEN_LIFETIME_MINUTES);
    let claims = TokenClaims {
        iat: now.timestamp(),
        nbf: (now - Duration::minutes(NOT_BEFORE_SKEW_MINUTES)).timestamp(),
        exp: expires.timestamp(),
        name: name.to_string(),
        groups,
        nonce: random_alphanumeric(10),
    };
    Ok((sign_claims(private, &claims)?, expires))
}

/// Sign arbitrary claims with an Ed25519 private JWK, setting `kid`.
pub(crate) fn sign_claims<T: Serialize>(private: &Jwk, claims: &T) -> Result<String, AppError> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(private.kid.clone());
    Ok(encode(&header, claims, &encoding_key(private)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::api::verify_token;

    #[test]
    fn issued_token_verifies_with_public_key() {
        let private = generate_signing_jwk();
        let (token, expires) =
            issue_token(&private, "joe@example.com", vec!["devs".into()], Utc::now()).unwrap();
        assert!(expires > Utc::now());

        let claims = verify_token(&token, &private.public()).unwrap();
        assert_eq!(claims.name, "joe@example.com");
        assert_eq!(claims.groups, vec!["devs".to_string()]);
        assert_eq!(claims.exp - claims.iat, TOKEN_LIFETIME_MINUTES * 60);
        assert!(!claims.nonce.is_empty());
    }

    #[test]
    fn token_from_another_key_is_rejected() {
        let signer = generate_signing_jwk();
        let other = generate_signing_jwk();
        let (token, _) = issue_token(&signer, "joe", vec![], Utc::now()).unwrap();
        assert!(verify_token(&token, &other.public()).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let private = generate_signing_jwk();
        let (token, _) =
            issue_token(&private, "joe", vec![], Utc::now() - Duration::hours(1)).unwrap();
        assert!(verify_token(&token, &private.public()).is_err());
    }

    #[test]
    fn public_key_cannot_sign() {
        let private = generate_signing_jwk();
        assert!(issue_token(&private.public(), "joe", vec![], Utc::now()).is_err());
    }
}
