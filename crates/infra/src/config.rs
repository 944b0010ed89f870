//! Environment configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `USE_PERSISTENT_STORES` | `false` | Postgres when true, in-memory otherwise |
//! | `DATABASE_URL` | (required when persistent) | Postgres connection string |
//! | `DATABASE_MAX_CONNECTIONS` | `10` | Pool size |
//! | `STOCK_LOCK_TIMEOUT_MS` | `2000` | Per-product lock wait before `Busy` |
//! | `RECENT_MOVEMENTS_LIMIT` | `10` | Dashboard window |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub backend: StoreBackend,
    pub lock_wait: Duration,
    pub recent_movements_limit: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            lock_wait: Duration::from_millis(2000),
            recent_movements_limit: crate::stock_levels::DEFAULT_RECENT_LIMIT,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let use_persistent = parse_or(get("USE_PERSISTENT_STORES"), "USE_PERSISTENT_STORES", false)?;

        let backend = if use_persistent {
            StoreBackend::Postgres {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or(
                    get("DATABASE_MAX_CONNECTIONS"),
                    "DATABASE_MAX_CONNECTIONS",
                    10,
                )?,
            }
        } else {
            StoreBackend::InMemory
        };

        let lock_wait_ms: u64 = parse_or(get("STOCK_LOCK_TIMEOUT_MS"), "STOCK_LOCK_TIMEOUT_MS", 2000)?;
        let recent_movements_limit = parse_or(
            get("RECENT_MOVEMENTS_LIMIT"),
            "RECENT_MOVEMENTS_LIMIT",
            crate::stock_levels::DEFAULT_RECENT_LIMIT,
        )?;

        Ok(Self {
            backend,
            lock_wait: Duration::from_millis(lock_wait_ms),
            recent_movements_limit,
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, StoreBackend::Postgres { .. })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
