use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub acquire_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub tick_interval: Duration,
    pub startup_grace: Duration,
    pub snapshot_validity: Duration,
    pub negotiation_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub heartbeat_expiry: Duration,
    pub active_flag_expiry: Duration,
    /// Commission rate in parts-per-million of gross trade value.
    pub commission_rate_ppm: i64,
    pub advisory_max_spread_pct: f64,
    pub advisory_resend: Duration,
    pub book_depth: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            startup_grace: Duration::from_secs(10),
            snapshot_validity: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(60),
            heartbeat_expiry: Duration::from_secs(600),
            active_flag_expiry: Duration::from_secs(300),
            commission_rate_ppm: 1_000,
            advisory_max_spread_pct: 20.0,
            advisory_resend: Duration::from_secs(300),
            book_depth: 10,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let matching = MatchingConfig {
        tick_interval: Duration::from_secs(env_u64("MATCH_TICK_SECONDS", 5).max(1)),
        startup_grace: Duration::from_secs(env_u64("MATCH_STARTUP_GRACE_SECONDS", 10)),
        snapshot_validity: Duration::from_secs(env_u64("SNAPSHOT_VALIDITY_SECONDS", 30)),
        negotiation_timeout: Duration::from_secs(env_u64("NEGOTIATION_TIMEOUT_SECONDS", 30).max(1)),
        confirmation_timeout: Duration::from_secs(env_u64("CONFIRMATION_TIMEOUT_SECONDS", 60).max(1)),
        heartbeat_expiry: Duration::from_secs(env_u64("HEARTBEAT_EXPIRY_SECONDS", 600)),
        active_flag_expiry: Duration::from_secs(env_u64("ACTIVE_FLAG_EXPIRY_SECONDS", 300)),
        commission_rate_ppm: (env_f64("COMMISSION_RATE", 0.001) * 1_000_000.0).round() as i64,
        advisory_max_spread_pct: env_f64("ADVISORY_MAX_SPREAD_PCT", 20.0),
        advisory_resend: Duration::from_secs(env_u64("ADVISORY_RESEND_SECONDS", 300)),
        book_depth: env_u64("BOOK_DEPTH", 10).max(1) as usize,
    };
    if matching.commission_rate_ppm < 0 {
        return Err(anyhow!("COMMISSION_RATE must be >= 0"));
    }
    Ok(AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 2),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 16),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
        },
        matching,
    })
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
