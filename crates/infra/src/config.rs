//! Store configuration from the process environment.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | required |
//! | `LYMBO_TABLE` | `tickets` |
//! | `LYMBO_MAX_CONNECTIONS` | `10` |
//! | `LYMBO_ACQUIRE_TIMEOUT_SECS` | `5` |
//! | `LYMBO_BACKOFF_BASE` | `1.5` |
//! | `LYMBO_MAX_BACKOFF_SECS` | `15` |
//! | `LYMBO_EXPIRE_BATCH` | `1000` |
//! | `LYMBO_EXPIRE_INTERVAL_SECS` | `30` |

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use lymbo_core::BackoffPolicy;

use crate::ticket_store::postgres::{DEFAULT_TABLE, validate_table_name};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub database_url: String,
    pub table: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub expire_batch: usize,
    pub expire_interval: Duration,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset and empty values take
    /// the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let table = get("LYMBO_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if let Err(e) = validate_table_name(&table) {
            return Err(ConfigError::Invalid {
                var: "LYMBO_TABLE",
                value: table,
                reason: e.to_string(),
            });
        }

        let max_connections: u32 = parse_or(&get, "LYMBO_MAX_CONNECTIONS", 10)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "LYMBO_MAX_CONNECTIONS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let acquire_timeout = Duration::from_secs(parse_or(&get, "LYMBO_ACQUIRE_TIMEOUT_SECS", 5)?);

        let base: f64 = parse_or(&get, "LYMBO_BACKOFF_BASE", BackoffPolicy::DEFAULT_BASE)?;
        let max_delay = Duration::from_secs(parse_or(
            &get,
            "LYMBO_MAX_BACKOFF_SECS",
            BackoffPolicy::DEFAULT_MAX_DELAY.as_secs(),
        )?);
        let backoff = BackoffPolicy::new(base, max_delay);
        if !backoff.is_valid() {
            return Err(ConfigError::Invalid {
                var: "LYMBO_BACKOFF_BASE",
                value: base.to_string(),
                reason: "must be finite and >= 1.0".to_string(),
            });
        }

        let expire_batch: usize = parse_or(&get, "LYMBO_EXPIRE_BATCH", 1000)?;
        let expire_interval = Duration::from_secs(parse_or(&get, "LYMBO_EXPIRE_INTERVAL_SECS", 30)?);
        if expire_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "LYMBO_EXPIRE_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            database_url,
            table,
            max_connections,
            acquire_timeout,
            backoff,
            expire_batch,
            expire_interval,
        })
    }

    /// Pool options derived from this configuration (not yet connected).
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let cfg = StoreConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/q")]))
            .unwrap();

        assert_eq!(cfg.database_url, "postgres://localhost/q");
        assert_eq!(cfg.table, "tickets");
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(5));
        assert_eq!(cfg.backoff, BackoffPolicy::default());
        assert_eq!(cfg.expire_batch, 1000);
        assert_eq!(cfg.expire_interval, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = StoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/q"),
            ("LYMBO_TABLE", "mail_queue"),
            ("LYMBO_MAX_CONNECTIONS", "32"),
            ("LYMBO_BACKOFF_BASE", "2"),
            ("LYMBO_MAX_BACKOFF_SECS", "300"),
            ("LYMBO_EXPIRE_BATCH", " 50 "),
        ]))
        .unwrap();

        assert_eq!(cfg.table, "mail_queue");
        assert_eq!(cfg.max_connections, 32);
        assert_eq!(cfg.backoff, BackoffPolicy::new(2.0, Duration::from_secs(300)));
        assert_eq!(cfg.expire_batch, 50);
    }

    #[test]
    fn missing_database_url_is_reported() {
        assert_eq!(
            StoreConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let cases = [
            ("LYMBO_MAX_CONNECTIONS", "many"),
            ("LYMBO_MAX_CONNECTIONS", "0"),
            ("LYMBO_BACKOFF_BASE", "0.5"),
            ("LYMBO_TABLE", "drop table"),
            ("LYMBO_EXPIRE_INTERVAL_SECS", "0"),
        ];

        for (var, value) in cases {
            let err = StoreConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://db/q"),
                (var, value),
            ]))
            .unwrap_err();
            match err {
                ConfigError::Invalid { var: got, .. } => assert_eq!(got, var),
                other => panic!("unexpected error for {var}: {other:?}"),
            }
        }
    }
}
