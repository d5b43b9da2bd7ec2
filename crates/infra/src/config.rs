//! Configuration loading and representation.
//!
//! Everything comes from the process environment:
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | unset (in-memory store) |
//! | `MONEYBOX_DB_MAX_CONNECTIONS` | `10` |
//! | `MONEYBOX_DB_ACQUIRE_TIMEOUT_MS` | `5000` |
//! | `MONEYBOX_CREDIT_DEADLINE_MS` | unset (no deadline) |
//! | `MONEYBOX_MAX_PAGE_SIZE` | `100` |

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use moneybox_ledger::DEFAULT_MAX_PAGE_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("DATABASE_URL must be set to connect to Postgres")]
    MissingDatabaseUrl,

    #[error("failed to connect to Postgres: {0}")]
    Connect(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Deadline for obtaining a pooled connection (and thus a unit of work).
    pub acquire_timeout: Duration,
    /// Optional bound on a whole credit, lock waits included.
    pub credit_deadline: Option<Duration>,
    pub max_page_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_millis(5_000),
            credit_deadline: None,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_connections = match non_empty("MONEYBOX_DB_MAX_CONNECTIONS") {
            Some(raw) => positive::<u32>("MONEYBOX_DB_MAX_CONNECTIONS", &raw)?,
            None => defaults.max_connections,
        };
        let acquire_timeout = match non_empty("MONEYBOX_DB_ACQUIRE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(positive("MONEYBOX_DB_ACQUIRE_TIMEOUT_MS", &raw)?),
            None => defaults.acquire_timeout,
        };
        let credit_deadline = non_empty("MONEYBOX_CREDIT_DEADLINE_MS")
            .map(|raw| positive("MONEYBOX_CREDIT_DEADLINE_MS", &raw).map(Duration::from_millis))
            .transpose()?;
        let max_page_size = match non_empty("MONEYBOX_MAX_PAGE_SIZE") {
            Some(raw) => positive::<u32>("MONEYBOX_MAX_PAGE_SIZE", &raw)?,
            None => defaults.max_page_size,
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            max_connections,
            acquire_timeout,
            credit_deadline,
            max_page_size,
        })
    }

    /// Open a Postgres pool sized and timed per this config.
    pub async fn connect(&self) -> Result<PgPool, ConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(url)
            .await?;

        info!(
            max_connections = self.max_connections,
            acquire_timeout_ms = self.acquire_timeout.as_millis() as u64,
            "connected to Postgres"
        );
        Ok(pool)
    }
}

fn positive<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason,
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if value <= T::default() {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(value)
}
