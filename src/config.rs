// src/config.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::credential::ALGORITHM;

/// What ingestion does when the device has no binding to the patient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Reject with `NotAssigned`.
    Strict,
    /// Create the binding in the same transaction as the reading.
    #[default]
    AutoAssign,
}

impl FromStr for AssignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "auto-assign" | "auto_assign" | "auto" => Ok(Self::AutoAssign),
            other => Err(format!("unknown assignment policy {other:?}")),
        }
    }
}

/// What `/register` does for a device id that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReregistrationPolicy {
    /// Keep the existing row and issue a fresh token.
    #[default]
    Reissue,
    /// Fail with `DeviceExists`.
    Reject,
}

impl FromStr for ReregistrationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reissue" => Ok(Self::Reissue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown reregistration policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    pub assignment: AssignmentPolicy,
    pub reregistration: ReregistrationPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: PathBuf,
    pub token_ttl: Duration,
    pub policy: Policy,
    pub bind_addr: SocketAddr,
    pub request_timeout: StdDuration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let public_key_path = get("JWT_PUBLIC_KEY_PATH")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("JWT_PUBLIC_KEY_PATH"))?;
        let private_key_path = get("JWT_PRIVATE_KEY_PATH").map(PathBuf::from);

        let algorithm = get("JWT_ALGORITHM").unwrap_or_else(|| ALGORITHM.into());
        if algorithm != ALGORITHM {
            return Err(ConfigError::Invalid {
                key: "JWT_ALGORITHM",
                reason: format!("only {ALGORITHM} is supported, got {algorithm}"),
            });
        }

        let expire_minutes: i64 = parse(&get, "JWT_EXPIRE_MINUTES", 60 * 24 * 7)?;
        if expire_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "JWT_EXPIRE_MINUTES",
                reason: "must be positive".into(),
            });
        }

        let policy = Policy {
            assignment: parse(&get, "ASSIGNMENT_POLICY", AssignmentPolicy::default())?,
            reregistration: parse(&get, "REREGISTRATION_POLICY", ReregistrationPolicy::default())?,
        };

        Ok(Self {
            database_url,
            db_max_connections: parse(&get, "DB_MAX_CONNECTIONS", 10)?,
            private_key_path,
            public_key_path,
            token_ttl: Duration::minutes(expire_minutes),
            policy,
            bind_addr: parse(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            request_timeout: StdDuration::from_secs(parse(&get, "REQUEST_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}
