//! Shared helpers for connector-service integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use service_core::api::{Jwk, TokenClaims};

static TRACING: Once = Once::new();

pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Signs user tokens the way the server does.
pub struct TokenSigner {
    key: SigningKey,
    pub jwk: Jwk,
}

impl TokenSigner {
    pub fn new() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let jwk = Jwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x: URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
            d: None,
            kid: "test".into(),
            alg: "EdDSA".into(),
            use_: "sig".into(),
        };
        Self { key, jwk }
    }

    pub fn token(&self, name: &str, groups: &[&str]) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iat: now,
            nbf: now,
            exp: now + 300,
            name: name.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            nonce: "nonce".into(),
        };
        let der = self.key.to_pkcs8_der().unwrap();
        encode(
            &Header::new(Algorithm::EdDSA),
            &claims,
            &EncodingKey::from_ed_der(der.as_bytes()),
        )
        .unwrap()
    }
}

pub fn list_json(items: Vec<Value>, index: i64) -> Value {
    json!({
        "count": items.len(),
        "items": items,
        "lastUpdateIndex": {"index": index},
    })
}

pub fn grant_json(id: &str, subject: &str, privilege: &str, resource: &str) -> Value {
    json!({
        "id": id,
        "created": "2024-01-01T00:00:00Z",
        "createdBy": "2",
        "updated": "2024-01-01T00:00:00Z",
        "subject": subject,
        "privilege": privilege,
        "resource": resource,
    })
}

pub fn destination_json(id: &str, name: &str, kind: &str) -> Value {
    json!({
        "id": id,
        "uniqueID": "unique",
        "name": name,
        "kind": kind,
        "created": "2024-01-01T00:00:00Z",
        "updated": "2024-01-01T00:00:00Z",
        "connection": {"url": "127.0.0.1:8443", "ca": ""},
        "resources": [],
        "roles": [],
        "lastSeen": null,
        "connected": true,
        "version": "",
    })
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
