//! Connection settings for destination engines

use thiserror::Error;

/// Connection-level failures
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to connect to the warehouse: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Invalid warehouse settings: {0}")]
    Config(String),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
        }
    }

    /// Read `DATABASE_URL` and the optional `DB_MAX_CONNECTIONS`,
    /// `DB_MIN_CONNECTIONS`, `DB_CONNECT_TIMEOUT` and `DB_IDLE_TIMEOUT`
    /// (seconds). A `.env` file in the working directory is loaded first.
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::new(
            std::env::var("DATABASE_URL")
                .map_err(|_| EngineError::config("DATABASE_URL is not set"))?,
        );
        if let Some(max) = env_setting("DB_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(min) = env_setting("DB_MIN_CONNECTIONS")? {
            config.min_connections = min;
        }
        if let Some(secs) = env_setting("DB_CONNECT_TIMEOUT")? {
            config.connect_timeout_secs = secs;
        }
        config.idle_timeout_secs = env_setting("DB_IDLE_TIMEOUT")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self { url, .. } if url.trim().is_empty() => {
                Err(EngineError::config("warehouse URL is empty"))
            }
            Self { max_connections: 0, .. } => {
                Err(EngineError::config("the pool needs at least one connection"))
            }
            Self {
                min_connections,
                max_connections,
                ..
            } if min_connections > max_connections => Err(EngineError::config(format!(
                "pool minimum {} exceeds maximum {}",
                min_connections, max_connections
            ))),
            _ => Ok(()),
        }
    }

    /// In-memory SQLite databases exist per connection
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Unset means `None`; a value that does not parse is an error
fn env_setting<T: std::str::FromStr>(name: &str) -> EngineResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::config(format!("{} is not a valid number: '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
