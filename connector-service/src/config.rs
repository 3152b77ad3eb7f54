//! Configuration for the connector agent.

use service_core::api::DestinationKind;
use service_core::config::{get_env, get_env_opt, get_env_parsed, Environment};
use service_core::error::AppError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub server: ServerConfig,
    /// Destination name grants refer to.
    pub name: String,
    pub kind: DestinationKind,
    /// Address users reach this connector (or host) at, `host:port`.
    pub endpoint_addr: String,
    pub destination_sync_interval: Duration,
    /// Plain HTTP listener for `/healthz` and `/metrics`.
    pub metrics_addr: SocketAddr,
    pub kubernetes: KubernetesConfig,
    pub ssh: SshConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub url: String,
    pub access_key: String,
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// API server URL. Unset means infer from the environment.
    pub api_url: Option<String>,
    pub ca_path: PathBuf,
    pub token_path: PathBuf,
    /// Namespace service accounts for destination credentials live in.
    pub namespace: String,
    /// Lifetime of minted service-account tokens.
    pub credential_ttl: Duration,
    pub proxy_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Group every managed local user joins.
    pub group: String,
    pub sshd_config_path: PathBuf,
    pub passwd_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Directory holding the connector CA (`ca.crt`, `ca.key`).
    pub cert_cache_dir: PathBuf,
}

impl ConnectorConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let environment = Environment::from_env()?;
        let is_prod = environment.is_prod();

        let kind: DestinationKind = get_env("CONNECTOR_KIND", Some("kubernetes"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let config = Self {
            environment,
            service_name: get_env("SERVICE_NAME", Some("connector-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: get_env_opt("OTLP_ENDPOINT"),
            server: ServerConfig {
                url: get_env("SERVER_URL", None, is_prod)?,
                access_key: get_env("ACCESS_KEY", None, is_prod)?,
            },
            name: get_env("DESTINATION_NAME", None, is_prod)?,
            kind,
            endpoint_addr: get_env("ENDPOINT_ADDR", None, is_prod)?,
            destination_sync_interval: Duration::from_secs(get_env_parsed(
                "DESTINATION_SYNC_INTERVAL_SECONDS",
                Some("30"),
                false,
            )?),
            metrics_addr: get_env_parsed("METRICS_ADDR", Some("0.0.0.0:9090"), false)?,
            kubernetes: KubernetesConfig {
                api_url: get_env_opt("KUBERNETES_API_URL"),
                ca_path: get_env("KUBERNETES_CA_PATH", Some(SERVICE_ACCOUNT_CA), false)?.into(),
                token_path: get_env("KUBERNETES_TOKEN_PATH", Some(SERVICE_ACCOUNT_TOKEN), false)?.into(),
                namespace: get_env("KUBERNETES_NAMESPACE", Some("infra"), false)?,
                credential_ttl: Duration::from_secs(get_env_parsed(
                    "CREDENTIAL_TTL_SECONDS",
                    Some("600"),
                    false,
                )?),
                proxy_addr: get_env_parsed("PROXY_ADDR", Some("0.0.0.0:443"), false)?,
            },
            ssh: SshConfig {
                group: get_env("SSH_GROUP", Some("infra-users"), false)?,
                sshd_config_path: get_env("SSHD_CONFIG_PATH", Some("/etc/ssh/sshd_config"), false)?.into(),
                passwd_path: get_env("PASSWD_PATH", Some("/etc/passwd"), false)?.into(),
            },
            tls: TlsConfig {
                cert_cache_dir: get_env("CERT_CACHE_DIR", Some("/var/lib/connector/certs"), false)?.into(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |msg: &str| Err(AppError::ConfigError(anyhow::anyhow!("{}", msg.to_string())));

        if self.server.url.trim().is_empty() {
            return invalid("SERVER_URL must not be empty");
        }
        if !self.server.url.starts_with("http://") && !self.server.url.starts_with("https://") {
            return invalid("SERVER_URL must be an http or https URL");
        }
        if self.server.access_key.trim().is_empty() {
            return invalid("ACCESS_KEY must not be empty");
        }
        if self.name.trim().is_empty() {
            return invalid("DESTINATION_NAME must not be empty");
        }
        if self.name.contains('.') {
            return invalid("DESTINATION_NAME must not contain '.'");
        }
        if self.endpoint_addr.trim().is_empty() {
            return invalid("ENDPOINT_ADDR must not be empty");
        }
        if self.destination_sync_interval.is_zero() {
            return invalid("DESTINATION_SYNC_INTERVAL_SECONDS must be positive");
        }

        match self.kind {
            DestinationKind::Kubernetes => {
                if self.kubernetes.namespace.is_empty() {
                    return invalid("KUBERNETES_NAMESPACE must not be empty");
                }
                if self.kubernetes.credential_ttl < Duration::from_secs(600) {
                    // the TokenRequest API refuses shorter lifetimes
                    return invalid("CREDENTIAL_TTL_SECONDS must be at least 600");
                }
                if self.kubernetes.proxy_addr.port() == 0 {
                    return invalid("PROXY_ADDR needs a port");
                }
                if self.tls.cert_cache_dir.as_os_str().is_empty() {
                    return invalid("CERT_CACHE_DIR must not be empty");
                }
            }
            DestinationKind::Ssh => {
                if self.ssh.group.trim().is_empty() {
                    return invalid("SSH_GROUP must not be empty");
                }
                if self.ssh.sshd_config_path.as_os_str().is_empty() {
                    return invalid("SSHD_CONFIG_PATH must not be empty");
                }
            }
        }
        Ok(())
    }

    /// A development configuration for tests.
    pub fn for_tests(server_url: &str, kind: DestinationKind) -> Self {
        Self {
            environment: Environment::Dev,
            service_name: "connector-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            server: ServerConfig {
                url: server_url.to_string(),
                access_key: "aaaaaaaaaa.bbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            },
            name: "prod".to_string(),
            kind,
            endpoint_addr: "127.0.0.1:8443".to_string(),
            destination_sync_interval: Duration::from_secs(30),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            kubernetes: KubernetesConfig {
                api_url: None,
                ca_path: SERVICE_ACCOUNT_CA.into(),
                token_path: SERVICE_ACCOUNT_TOKEN.into(),
                namespace: "infra".to_string(),
                credential_ttl: Duration::from_secs(600),
                proxy_addr: SocketAddr::from(([127, 0, 0, 1], 8443)),
            },
            ssh: SshConfig {
                group: "infra-users".to_string(),
                sshd_config_path: "/etc/ssh/sshd_config".into(),
                passwd_path: "/etc/passwd".into(),
            },
            tls: TlsConfig {
                cert_cache_dir: "/tmp/connector-certs".into(),
            },
        }
    }
}
