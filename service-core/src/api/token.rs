//! Signed identity tokens the server issues and connectors verify.

use crate::error::AppError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Tolerated clock skew, in seconds, when checking `nbf` and `exp`.
pub const CLOCK_SKEW_SECONDS: u64 = 5 * 60;

/// An Ed25519 key in JWK form. `d` is present only on private keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub alg: String,
    #[serde(rename = "use", default)]
    pub use_: String,
}

impl std::fmt::Debug for Jwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("kid", &self.kid)
            .field("private", &self.d.is_some())
            .finish()
    }
}

impl Jwk {
    /// The same key without its private half.
    pub fn public(&self) -> Jwk {
        Jwk {
            d: None,
            ..self.clone()
        }
    }

    pub fn decoding_key(&self) -> Result<DecodingKey, AppError> {
        if self.kty != "OKP" || self.crv != "Ed25519" {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "unsupported key type {}/{}",
                self.kty,
                self.crv
            )));
        }
        Ok(DecodingKey::from_ed_components(&self.x)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Claims carried by a server-issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub nonce: String,
}

/// Verify a token's signature, `exp` and `nbf` against `key`.
pub fn verify_token(token: &str, key: &Jwk) -> Result<TokenClaims, AppError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.leeway = CLOCK_SKEW_SECONDS;
    validation.validate_nbf = true;
    validation.required_spec_claims = ["exp", "nbf"].iter().map(|c| c.to_string()).collect();

    let data = jsonwebtoken::decode::<TokenClaims>(token, &key.decoding_key()?, &validation)?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_drops_private_half() {
        let jwk = Jwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x: "abc".into(),
            d: Some("secret".into()),
            kid: "k1".into(),
            alg: "EdDSA".into(),
            use_: "sig".into(),
        };
        let public = jwk.public();
        assert!(public.d.is_none());
        let body = serde_json::to_value(&public).unwrap();
        assert!(body.get("d").is_none());
        assert_eq!(body["use"], "sig");
        assert!(!format!("{:?}", jwk).contains("secret"));
    }

    #[test]
    fn rejects_non_ed25519_keys() {
        let jwk = Jwk {
            kty: "RSA".into(),
            crv: String::new(),
            x: String::new(),
            d: None,
            kid: String::new(),
            alg: String::new(),
            use_: String::new(),
        };
        assert!(jwk.decoding_key().is_err());
    }
}
