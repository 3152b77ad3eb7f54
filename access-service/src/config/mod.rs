//! Configuration module for access-service.

use service_core::config::{self as core_config, get_env, get_env_opt, get_env_parsed, Environment};
use service_core::error::AppError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub keys: KeyConfig,
    pub timeouts: TimeoutConfig,
    pub default_org: DefaultOrgConfig,
    pub session: SessionConfig,
    pub jobs: JobConfig,
    /// Base URL users open to approve a device login.
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Upper bound on concurrent long-polls.
    pub listener_max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Directory holding root keys.
    pub root_key_path: PathBuf,
    pub root_key_id: String,
    /// Name of the database data key in `encryption_keys`.
    pub data_key_name: String,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub request: Duration,
    /// Deadline for long-poll and credential rendezvous requests.
    pub blocking_request: Duration,
}

#[derive(Debug, Clone)]
pub struct DefaultOrgConfig {
    pub name: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub duration: Duration,
    /// Sliding inactivity window applied to login access keys.
    pub extension: Duration,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub interval: Duration,
}

impl AccessConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let environment = Environment::from_env()?;
        let is_prod = environment.is_prod();

        let config = Self {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("access-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: get_env_opt("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", Some("10"), false)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", Some("2"), false)?,
                listener_max_connections: get_env_parsed(
                    "DATABASE_LISTENER_MAX_CONNECTIONS",
                    Some("100"),
                    false,
                )?,
            },
            keys: KeyConfig {
                root_key_path: get_env("ROOT_KEY_PATH", Some("/var/lib/access-service/keys"), is_prod)?
                    .into(),
                root_key_id: get_env("ROOT_KEY_ID", Some("root"), false)?,
                data_key_name: get_env("DATA_KEY_NAME", Some("dbkey"), false)?,
            },
            timeouts: TimeoutConfig {
                request: Duration::from_secs(get_env_parsed(
                    "REQUEST_TIMEOUT_SECONDS",
                    Some("60"),
                    false,
                )?),
                blocking_request: Duration::from_secs(get_env_parsed(
                    "BLOCKING_REQUEST_TIMEOUT_SECONDS",
                    Some("300"),
                    false,
                )?),
            },
            default_org: DefaultOrgConfig {
                name: get_env("DEFAULT_ORG_NAME", Some("default"), false)?,
                domain: get_env("DEFAULT_ORG_DOMAIN", Some(""), false)?,
            },
            session: SessionConfig {
                duration: Duration::from_secs(get_env_parsed(
                    "SESSION_DURATION_SECONDS",
                    Some("43200"),
                    false,
                )?),
                extension: Duration::from_secs(get_env_parsed(
                    "SESSION_EXTENSION_SECONDS",
                    Some("10800"),
                    false,
                )?),
            },
            jobs: JobConfig {
                interval: Duration::from_secs(get_env_parsed(
                    "JOB_INTERVAL_SECONDS",
                    Some("3600"),
                    false,
                )?),
            },
            base_url: get_env("BASE_URL", Some("http://localhost:8080"), is_prod)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |msg: &str| Err(AppError::ConfigError(anyhow::anyhow!("{}", msg.to_string())));

        if self.common.port == 0 {
            return invalid("port must be non-zero");
        }
        if self.database.url.trim().is_empty() {
            return invalid("DATABASE_URL must not be empty");
        }
        if self.database.max_connections == 0 || self.database.listener_max_connections == 0 {
            return invalid("database pools need at least one connection");
        }
        if self.database.min_connections > self.database.max_connections {
            return invalid("DATABASE_MIN_CONNECTIONS exceeds DATABASE_MAX_CONNECTIONS");
        }
        if self.timeouts.request.is_zero() || self.timeouts.blocking_request.is_zero() {
            return invalid("request timeouts must be positive");
        }
        if self.session.duration.is_zero() {
            return invalid("SESSION_DURATION_SECONDS must be positive");
        }
        if self.jobs.interval.is_zero() {
            return invalid("JOB_INTERVAL_SECONDS must be positive");
        }
        if self.keys.root_key_id.is_empty() || self.keys.data_key_name.is_empty() {
            return invalid("ROOT_KEY_ID and DATA_KEY_NAME must not be empty");
        }
        Ok(())
    }

    /// A development configuration pointed at `database_url`, for tests.
    pub fn for_tests(database_url: &str, root_key_path: PathBuf) -> Self {
        Self {
            common: core_config::Config {
                port: 0,
                ..core_config::Config::default()
            },
            environment: Environment::Dev,
            service_name: "access-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: 5,
                min_connections: 1,
                listener_max_connections: 10,
            },
            keys: KeyConfig {
                root_key_path,
                root_key_id: "root".to_string(),
                data_key_name: "dbkey".to_string(),
            },
            timeouts: TimeoutConfig {
                request: Duration::from_secs(60),
                blocking_request: Duration::from_secs(5),
            },
            default_org: DefaultOrgConfig {
                name: "default".to_string(),
                domain: String::new(),
            },
            session: SessionConfig {
                duration: Duration::from_secs(12 * 3600),
                extension: Duration::from_secs(3 * 3600),
            },
            jobs: JobConfig {
                interval: Duration::from_secs(3600),
            },
            base_url: "http://localhost".to_string(),
        }
    }
}
