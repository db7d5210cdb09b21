//! Configuration loading from the environment.

use std::{env, path::Path, time::Duration};

use crate::error::{RelayError, Result};
use crate::event;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Relay signing key (hex).
    pub relay_privkey: String,
    /// Relay public key (lowercase hex), derived from the private key.
    pub relay_pubkey: String,
    /// HTTP bind address, e.g. `:8080` or `127.0.0.1:8080`.
    pub http_addr: String,
    /// Log level name passed to the tracing subscriber.
    pub log_level: String,
    /// Token-bucket burst size per author.
    pub rate_limit_burst: u32,
    /// Sustained events per minute per author.
    pub rate_limit_per_minute: u32,
    /// Proof-of-work bits required for kinds without an explicit target.
    pub default_pow_bits: i32,
    /// Maximum allowed |now - created_at| for incoming events.
    pub max_event_skew: Duration,
}

impl Config {
    /// Load settings from `path` (if it exists) and the process environment.
    pub fn from_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .map_err(|e| RelayError::Validation(format!("reading env file: {e}")))?;
        }

        let database_url = env::var("DATABASE_URL").unwrap_or_default();
        if database_url.is_empty() {
            return Err(RelayError::Validation("DATABASE_URL is required".into()));
        }

        let relay_privkey = env::var("RELAY_PRIVKEY")
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if relay_privkey.is_empty() {
            return Err(RelayError::Validation("RELAY_PRIVKEY is required".into()));
        }
        let derived_pubkey = event::derive_pubkey(&relay_privkey)
            .map_err(|e| RelayError::Validation(format!("RELAY_PRIVKEY is invalid: {e}")))?;

        let relay_pubkey = env::var("RELAY_PUBKEY")
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let relay_pubkey = if relay_pubkey.is_empty() {
            derived_pubkey
        } else if relay_pubkey == derived_pubkey {
            relay_pubkey
        } else {
            return Err(RelayError::Validation(
                "RELAY_PUBKEY does not match RELAY_PRIVKEY".into(),
            ));
        };

        let rate_limit_burst = int_or_default("RATE_LIMIT_BURST", 30);
        if rate_limit_burst <= 0 {
            return Err(RelayError::Validation(
                "RATE_LIMIT_BURST must be > 0".into(),
            ));
        }
        let rate_limit_per_minute = int_or_default("RATE_LIMIT_PER_MIN", 120);
        if rate_limit_per_minute <= 0 {
            return Err(RelayError::Validation(
                "RATE_LIMIT_PER_MIN must be > 0".into(),
            ));
        }
        let max_skew_seconds = int_or_default("MAX_EVENT_SKEW_SECONDS", 300);
        if max_skew_seconds <= 0 {
            return Err(RelayError::Validation(
                "MAX_EVENT_SKEW_SECONDS must be > 0".into(),
            ));
        }

        Ok(Self {
            database_url,
            relay_privkey,
            relay_pubkey,
            http_addr: string_or_default("HTTP_ADDR", ":8080"),
            log_level: string_or_default("LOG_LEVEL", "info"),
            rate_limit_burst: rate_limit_burst as u32,
            rate_limit_per_minute: rate_limit_per_minute as u32,
            default_pow_bits: int_or_default("DEFAULT_POW_BITS", 0) as i32,
            max_event_skew: Duration::from_secs(max_skew_seconds as u64),
        })
    }
}

fn string_or_default(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

/// Read an integer variable, keeping the fallback on absence or parse failure.
fn int_or_default(key: &str, fallback: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(fallback)
}
