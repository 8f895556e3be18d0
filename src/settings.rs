// ============================================================================
// Settings loaded from the process environment
// ============================================================================

use crate::connection::config::{DatabaseConfig, EngineConfig, Endpoint};
use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment. Selects which database name is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(DbError::ConfigError(format!(
                "ENVIRONMENT must be development, production or test, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Everything the database core reads from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub server: String,
    pub port: u16,
    pub name_production: String,
    pub name_test: String,
    pub user: String,
    pub password: String,
    pub options: Option<String>,
    pub url: Option<String>,
    pub url_test: Option<String>,
    pub reader_url: Option<String>,
    pub pool_size: usize,
    pub max_overflow: usize,
    pub pool_recycle: Option<Duration>,
    pub pool_timeout: Duration,
    pub pool_pre_ping: bool,
    pub show_sql_queries: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            server: "localhost".to_string(),
            port: 5432,
            name_production: "app".to_string(),
            name_test: "app_test".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            options: None,
            url: None,
            url_test: None,
            reader_url: None,
            pool_size: 10,
            max_overflow: 20,
            pool_recycle: Some(Duration::from_secs(3600)),
            pool_timeout: Duration::from_secs(30),
            pool_pre_ping: true,
            show_sql_queries: false,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`. Unset and empty variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let environment = match get("ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => defaults.environment,
        };

        Ok(Self {
            environment,
            server: get("DB_SERVER").unwrap_or(defaults.server),
            port: parse_var(&get, "DB_PORT")?.unwrap_or(defaults.port),
            name_production: get("DB_NAME_PRODUCTION").unwrap_or(defaults.name_production),
            name_test: get("DB_NAME_TEST").unwrap_or(defaults.name_test),
            user: get("DB_USER").unwrap_or(defaults.user),
            password: get("DB_PASSWORD").unwrap_or(defaults.password),
            options: get("DB_OPTIONS"),
            url: get("DATABASE_URL"),
            url_test: get("DATABASE_URL_TEST"),
            reader_url: get("DATABASE_READER_URL"),
            pool_size: parse_var(&get, "DB_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            max_overflow: parse_var(&get, "DB_MAX_OVERFLOW")?.unwrap_or(defaults.max_overflow),
            pool_recycle: match parse_var::<i64>(&get, "DB_POOL_RECYCLE")? {
                Some(secs) if secs < 0 => None,
                Some(secs) => Some(Duration::from_secs(secs.unsigned_abs())),
                None => defaults.pool_recycle,
            },
            pool_timeout: parse_var(&get, "DB_POOL_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool_timeout),
            pool_pre_ping: parse_flag(&get, "DB_POOL_PRE_PING")?.unwrap_or(defaults.pool_pre_ping),
            show_sql_queries: parse_flag(&get, "SHOW_SQL_QUERIES")?
                .unwrap_or(defaults.show_sql_queries),
        })
    }

    /// `DB_NAME_TEST` in the test environment, `DB_NAME_PRODUCTION` otherwise.
    pub fn database_name(&self) -> &str {
        match self.environment {
            Environment::Test => &self.name_test,
            _ => &self.name_production,
        }
    }

    /// Build the writer and reader pool descriptors.
    ///
    /// The writer uses `DATABASE_URL` (`DATABASE_URL_TEST` under test) when
    /// set, otherwise an endpoint composed from the `DB_*` variables. The
    /// reader uses `DATABASE_READER_URL` when set and the writer's endpoint
    /// otherwise.
    pub fn database_config(&self) -> Result<DatabaseConfig> {
        let url_override = match self.environment {
            Environment::Test => self.url_test.as_deref(),
            _ => self.url.as_deref(),
        };

        let writer_endpoint = match url_override {
            Some(url) => parse_url(url)?.endpoint,
            None => {
                let mut endpoint = Endpoint::new(&self.server, self.database_name())
                    .port(self.port)
                    .credentials(&self.user, &self.password);
                if let Some(options) = &self.options {
                    endpoint = endpoint.options(options);
                }
                endpoint
            }
        };

        let reader_endpoint = match &self.reader_url {
            Some(url) => parse_url(url)?.endpoint,
            None => writer_endpoint.clone(),
        };

        let writer = self.apply_pool_policy(EngineConfig::new(writer_endpoint));
        let reader = self.apply_pool_policy(EngineConfig::new(reader_endpoint));

        writer.validate().map_err(DbError::ConfigError)?;
        reader.validate().map_err(DbError::ConfigError)?;

        Ok(DatabaseConfig::new(writer, reader))
    }

    fn apply_pool_policy(&self, config: EngineConfig) -> EngineConfig {
        config
            .pool_size(self.pool_size)
            .max_overflow(self.max_overflow)
            .recycle(self.pool_recycle)
            .pool_timeout(self.pool_timeout)
            .pre_ping(self.pool_pre_ping)
            .echo(self.show_sql_queries)
    }
}

fn parse_url(url: &str) -> Result<EngineConfig> {
    EngineConfig::from_url(url).map_err(DbError::ConfigError)
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DbError::ConfigError(format!("{} has an invalid value '{}'", name, raw))),
        None => Ok(None),
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    match get(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(DbError::ConfigError(format!(
                "{} must be a boolean, got '{}'",
                name, raw
            ))),
        },
        None => Ok(None),
    }
}
