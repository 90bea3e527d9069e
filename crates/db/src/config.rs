use std::time::Duration;

use charvault_core::error::CoreError;
use charvault_core::pagination::MAX_PAGE_SIZE;

/// Connection settings for the PostgreSQL store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    /// Pool size (default: `20`).
    pub max_connections: u32,
}

impl DbConfig {
    /// Load connection settings from environment variables.
    ///
    /// | Env Var              | Default    |
    /// |----------------------|------------|
    /// | `DATABASE_URL`       | (required) |
    /// | `DB_MAX_CONNECTIONS` | `20`       |
    pub fn from_env() -> Result<Self, CoreError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| CoreError::Validation("DATABASE_URL must be set".into()))?;
        let max_connections = env_parse("DB_MAX_CONNECTIONS", 20u32)?;
        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

/// Behavioural settings for [`crate::repositories::CharacterRepo`].
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Upper bound for a single store round-trip (default: 10 s).
    pub store_timeout: Duration,
    /// Records processed per chunk by batch maintenance jobs (default: `100`).
    pub batch_chunk_size: i64,
    /// Largest page a caller may request (default: `100`).
    pub max_page_size: u32,
    /// Insert/merge attempts before a contended save gives up (default: `5`).
    pub max_save_attempts: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(10),
            batch_chunk_size: 100,
            max_page_size: MAX_PAGE_SIZE,
            max_save_attempts: 5,
        }
    }
}

impl RepoConfig {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// | Env Var              | Default |
    /// |----------------------|---------|
    /// | `STORE_TIMEOUT_SECS` | `10`    |
    /// | `BATCH_CHUNK_SIZE`   | `100`   |
    /// | `MAX_PAGE_SIZE`      | `100`   |
    /// | `MAX_SAVE_ATTEMPTS`  | `5`     |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();

        let timeout_secs = env_parse("STORE_TIMEOUT_SECS", defaults.store_timeout.as_secs())?;
        let batch_chunk_size = env_parse("BATCH_CHUNK_SIZE", defaults.batch_chunk_size)?;
        let max_page_size = env_parse("MAX_PAGE_SIZE", defaults.max_page_size)?;
        let max_save_attempts = env_parse("MAX_SAVE_ATTEMPTS", defaults.max_save_attempts)?;

        let config = Self {
            store_timeout: Duration::from_secs(timeout_secs),
            batch_chunk_size,
            max_page_size,
            max_save_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.store_timeout.is_zero() {
            return Err(CoreError::Validation("STORE_TIMEOUT_SECS must be positive".into()));
        }
        if self.batch_chunk_size < 1 {
            return Err(CoreError::Validation("BATCH_CHUNK_SIZE must be at least 1".into()));
        }
        if self.max_page_size < 1 {
            return Err(CoreError::Validation("MAX_PAGE_SIZE must be at least 1".into()));
        }
        if self.max_save_attempts < 1 {
            return Err(CoreError::Validation("MAX_SAVE_ATTEMPTS must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} must be a valid number, got '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RepoConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = RepoConfig {
            batch_chunk_size: 0,
            ..RepoConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = RepoConfig {
            store_timeout: Duration::ZERO,
            ..RepoConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
