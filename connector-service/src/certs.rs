//! Self-signed TLS for the impersonating proxy.
//!
//! The connector owns a CA whose PEM is published with the destination, so
//! clients can trust the proxy. Leaves are issued lazily for the set of hosts
//! the connector has been reached at; the set only grows, and each new host
//! reissues the leaf to cover all of them.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::error::ConnectorError;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "Infra Connector CA";

struct Leaves {
    hosts: Vec<String>,
    current: Option<Arc<CertifiedKey>>,
}

pub struct CertCache {
    ca_cert_pem: String,
    ca: Certificate,
    ca_key: KeyPair,
    leaves: Mutex<Leaves>,
}

impl fmt::Debug for CertCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertCache").field("hosts", &self.hosts()).finish_non_exhaustive()
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

impl CertCache {
    /// A cache with a freshly generated CA.
    pub fn generate() -> Result<Self, ConnectorError> {
        let ca_key = KeyPair::generate()?;
        let ca = ca_params().self_signed(&ca_key)?;
        Ok(Self::with_ca(ca.pem(), ca, ca_key))
    }

    /// A cache around an existing CA.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, ConnectorError> {
        let ca_key = KeyPair::from_pem(ca_key_pem)?;
        // Re-signing keeps subject and key identifier, which is all leaves need.
        let ca = CertificateParams::from_ca_cert_pem(ca_cert_pem)?.self_signed(&ca_key)?;
        Ok(Self::with_ca(ca_cert_pem.to_string(), ca, ca_key))
    }

    fn with_ca(ca_cert_pem: String, ca: Certificate, ca_key: KeyPair) -> Self {
        Self {
            ca_cert_pem,
            ca,
            ca_key,
            leaves: Mutex::new(Leaves {
                hosts: Vec::new(),
                current: None,
            }),
        }
    }

    /// Load the CA from `dir`, generating and saving one on first start.
    pub async fn load_or_create(dir: &Path) -> Result<Self, ConnectorError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        match (
            tokio::fs::read_to_string(&cert_path).await,
            tokio::fs::read_to_string(&key_path).await,
        ) {
            (Ok(cert), Ok(key)) => {
                tracing::info!(path = %cert_path.display(), "Loaded connector CA");
                return Self::from_pem(&cert, &key);
            }
            (Err(e), _) | (_, Err(e)) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let cache = Self::generate()?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&cert_path, cache.ca_pem()).await?;
        tokio::fs::write(&key_path, cache.ca_key.serialize_pem()).await?;
        restrict_permissions(&key_path).await?;
        tracing::info!(path = %cert_path.display(), "Generated connector CA");
        Ok(cache)
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn hosts(&self) -> Vec<String> {
        match self.leaves.lock() {
            Ok(leaves) => leaves.hosts.clone(),
            Err(poisoned) => poisoned.into_inner().hosts.clone(),
        }
    }

    /// Make sure the leaf covers `host`, reissuing it when the host is new.
    pub fn add_host(&self, host: &str) -> Result<Arc<CertifiedKey>, ConnectorError> {
        let mut leaves = self
            .leaves
            .lock()
            .map_err(|_| ConnectorError::Internal("certificate cache lock poisoned".to_string()))?;

        if let Some(current) = &leaves.current {
            if leaves.hosts.iter().any(|h| h == host) {
                return Ok(current.clone());
            }
        }

        let mut hosts = leaves.hosts.clone();
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
        tracing::debug!(hosts = ?hosts, "Issuing proxy certificate");

        let issued = Arc::new(self.issue(&hosts)?);
        leaves.hosts = hosts;
        leaves.current = Some(issued.clone());
        Ok(issued)
    }

    /// The current leaf. Before any host is known, one is issued for the
    /// empty host so local liveness checks can connect.
    pub fn certificate(&self) -> Result<Arc<CertifiedKey>, ConnectorError> {
        let current = match self.leaves.lock() {
            Ok(leaves) => leaves.current.clone(),
            Err(poisoned) => poisoned.into_inner().current.clone(),
        };
        match current {
            Some(cert) => Ok(cert),
            None => self.add_host(""),
        }
    }

    fn issue(&self, hosts: &[String]) -> Result<CertifiedKey, ConnectorError> {
        let mut names: Vec<String> = hosts.iter().filter(|h| !h.is_empty()).cloned().collect();
        if names.is_empty() {
            names.push("localhost".to_string());
        }

        let mut params = CertificateParams::new(names)?;
        params.distinguished_name.push(DnType::CommonName, "infra-connector");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.ca, &self.ca_key)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)?;
        let chain: Vec<CertificateDer<'static>> = vec![leaf.der().clone()];
        Ok(CertifiedKey::new(chain, signing_key))
    }
}

/// Hands the current leaf to rustls on every handshake.
#[derive(Debug, Clone)]
pub struct CertResolver(pub Arc<CertCache>);

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.0.certificate() {
            Ok(cert) => Some(cert),
            Err(e) => {
                tracing::error!(error = %e, "No certificate for TLS handshake");
                None
            }
        }
    }
}

/// DER bodies of every `CERTIFICATE` block in a PEM bundle. Other block
/// types are skipped.
pub fn pem_certificates(pem: &str) -> Result<Vec<Vec<u8>>, ConnectorError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectorError::Config(format!("invalid PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(ConnectorError::Config("no certificates in PEM".to_string()));
    }
    Ok(certs)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), ConnectorError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), ConnectorError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_host_reuses_the_leaf() {
        let cache = CertCache::generate().unwrap();
        let first = cache.add_host("connector.example.com").unwrap();
        let again = cache.add_host("connector.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn new_host_reissues_for_every_host() {
        let cache = CertCache::generate().unwrap();
        let first = cache.add_host("connector.example.com").unwrap();
        let second = cache.add_host("10.0.0.7").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hosts(), vec!["connector.example.com", "10.0.0.7"]);
        assert!(Arc::ptr_eq(&second, &cache.certificate().unwrap()));
    }

    #[test]
    fn certificate_before_any_host_uses_the_empty_host() {
        let cache = CertCache::generate().unwrap();
        cache.certificate().unwrap();
        assert_eq!(cache.hosts(), vec![String::new()]);
    }

    #[test]
    fn ca_pem_parses_back_to_der() {
        let cache = CertCache::generate().unwrap();
        let certs = pem_certificates(cache.ca_pem()).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(pem_certificates("not a pem").is_err());
    }

    #[test]
    fn bundle_yields_every_certificate_and_skips_keys() {
        let first = CertCache::generate().unwrap();
        let second = CertCache::generate().unwrap();
        let bundle = format!(
            "{}\n{}{}",
            first.ca_pem(),
            first.ca_key.serialize_pem(),
            second.ca_pem()
        );

        let certs = pem_certificates(&bundle).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], pem_certificates(first.ca_pem()).unwrap()[0]);
        assert_eq!(certs[1], pem_certificates(second.ca_pem()).unwrap()[0]);
    }

    #[test]
    fn corrupt_certificate_body_is_rejected() {
        let pem = "-----BEGIN CERTIFICATE-----\n!!!not base64!!!\n-----END CERTIFICATE-----\n";
        assert!(pem_certificates(pem).is_err());

        let unterminated = "-----BEGIN CERTIFICATE-----\nMIIB\n";
        assert!(pem_certificates(unterminated).is_err());
    }

    #[tokio::test]
    async fn ca_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = CertCache::load_or_create(dir.path()).await.unwrap();
        let second = CertCache::load_or_create(dir.path()).await.unwrap();
        assert_eq!(first.ca_pem(), second.ca_pem());
        second.add_host("connector.example.com").unwrap();
    }
}
