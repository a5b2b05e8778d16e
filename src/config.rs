use std::{str::FromStr, time::Duration};

use anyhow::Context;

use crate::rooms::JoinPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub store_timeout: Duration,
    pub broadcast_capacity: usize,
    pub join_policy: JoinPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://roomchat.db?mode=rwc".to_owned(),
            bind_addr: "0.0.0.0:5000".to_owned(),
            db_max_connections: 16,
            store_timeout: Duration::from_millis(5000),
            broadcast_capacity: 1024,
            join_policy: JoinPolicy::CreateIfMissing,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        let join_creates: bool = parse_or(&lookup, "JOIN_CREATES_ROOM", true)?;
        let timeout_ms: u64 = parse_or(&lookup, "STORE_TIMEOUT_MS", defaults.store_timeout.as_millis() as u64)?;

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            store_timeout: Duration::from_millis(timeout_ms),
            broadcast_capacity: parse_or(&lookup, "BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            join_policy: if join_creates { JoinPolicy::CreateIfMissing } else { JoinPolicy::RequireExisting },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{key}={raw:?} is not valid")),
        None => Ok(default),
    }
}
