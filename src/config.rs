//! Environment-driven settings for the database and the model backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::store::{GameStore, PostgresConfig, PostgresStore, SqliteStore, StoreError, StoreResult};

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MODEL: &str = "qwen2.5:3b-instruct";
pub const DEFAULT_MODEL_URL: &str = "http://localhost:11434/v1/chat/completions";
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

const REQUIRED_DB_VARS: [&str; 4] = ["DB_HOST", "DB_NAME", "DB_USER", "DB_PASSWORD"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Database credentials not set. Required: {}", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),
    #[error("invalid DB_PORT '{0}'")]
    InvalidPort(String),
    #[error("invalid model URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("model URL must use http or https, got '{0}'")]
    UnsupportedScheme(String),
}

/// Process environment as a lookup function. Blank values count as unset.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// `AGENT_DEBUG=1|true|yes` turns on debug output.
pub fn debug_enabled(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup("AGENT_DEBUG")
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub enum DatabaseSettings {
    Sqlite(PathBuf),
    Postgres(PostgresConfig),
}

impl DatabaseSettings {
    /// A SQLite path wins; otherwise the PostgreSQL `DB_*` variables are required.
    pub fn resolve(
        sqlite: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = sqlite {
            return Ok(DatabaseSettings::Sqlite(path));
        }

        let missing: Vec<&'static str> = REQUIRED_DB_VARS
            .into_iter()
            .filter(|key| lookup(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingCredentials(missing));
        }
        let var = |key: &str| lookup(key).unwrap_or_default();

        let port = match lookup("DB_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
            None => DEFAULT_DB_PORT,
        };

        Ok(DatabaseSettings::Postgres(PostgresConfig {
            host: var("DB_HOST"),
            port,
            database: var("DB_NAME"),
            user: var("DB_USER"),
            password: var("DB_PASSWORD"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }))
    }

    pub fn from_env(sqlite: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::resolve(sqlite, env_lookup)
    }

    pub fn open(&self) -> StoreResult<Arc<dyn GameStore>> {
        match self {
            DatabaseSettings::Sqlite(path) => {
                info!("Opening SQLite database {}", path.display());
                Ok(Arc::new(SqliteStore::open(path)?))
            }
            DatabaseSettings::Postgres(config) => {
                info!(
                    "Connecting to PostgreSQL {}:{}/{}",
                    config.host, config.port, config.database
                );
                Ok(Arc::new(PostgresStore::connect(config)?))
            }
        }
    }

    /// [`open`](Self::open) on the blocking pool, for callers on the runtime.
    pub async fn connect(self) -> StoreResult<Arc<dyn GameStore>> {
        tokio::task::spawn_blocking(move || self.open())
            .await
            .map_err(|e| StoreError::Backend(format!("store open task failed: {}", e)))?
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub endpoint: Url,
    pub model: String,
    pub timeout: Duration,
}

impl ModelSettings {
    /// Flags override `OLLAMA_MODEL` / `OLLAMA_URL`, which override the defaults.
    pub fn resolve(
        model: Option<String>,
        url: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let model = model
            .or_else(|| lookup("OLLAMA_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let raw_url = url
            .or_else(|| lookup("OLLAMA_URL"))
            .unwrap_or_else(|| DEFAULT_MODEL_URL.to_string());

        let endpoint = Url::parse(&raw_url).map_err(|source| ConfigError::InvalidUrl {
            url: raw_url.clone(),
            source,
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(endpoint.scheme().to_string()));
        }

        Ok(Self {
            endpoint,
            model,
            timeout: DEFAULT_MODEL_TIMEOUT,
        })
    }
}
