//! Configuration management for the AMM engine.
//! Supports environment variables with fallback to defaults.

use std::env;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub db: DbConfig,
}

/// Tunable knobs for the trading engine itself, as opposed to connection
/// plumbing (see `DbConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quantization granularity fed into every quote (fee, net, gross,
    /// amount). Distinct from the fixed 18-digit storage precision used
    /// for raw persisted amounts outside a quote.
    pub money_quant: Decimal,
    pub default_token: String,
    pub default_chain: String,
    /// Shares; a sell-all position at or below this is dust-cleaned rather
    /// than run through the AMM.
    pub dust_threshold: f64,
    pub price_bucket_seconds: i64,
    pub series_interval_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub statement_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            money_quant: Decimal::new(1, 2), // 0.01
            default_token: "USDC".to_string(),
            default_chain: "evm".to_string(),
            dust_threshold: 0.1,
            price_bucket_seconds: 5,
            series_interval_tag: "1M".to_string(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/amm_engine".to_string(),
            max_connections: 10,
            statement_timeout_ms: 5_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { engine: EngineConfig::default(), db: DbConfig::default() }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(v) = env::var("DATABASE_URL") {
            config.db.database_url = v;
        }
        if let Ok(v) = env::var("MAX_DB_CONNECTIONS") {
            config.db.max_connections = v.parse().unwrap_or(config.db.max_connections);
        }
        if let Ok(v) = env::var("STATEMENT_TIMEOUT_MS") {
            config.db.statement_timeout_ms = v.parse().unwrap_or(config.db.statement_timeout_ms);
        }
        if let Ok(v) = env::var("MONEY_QUANT") {
            if let Ok(parsed) = v.parse::<Decimal>() {
                config.engine.money_quant = parsed;
            }
        }
        if let Ok(v) = env::var("DEFAULT_TOKEN") {
            config.engine.default_token = v;
        }
        if let Ok(v) = env::var("DEFAULT_CHAIN") {
            config.engine.default_chain = v;
        }
        if let Ok(v) = env::var("DUST_THRESHOLD") {
            config.engine.dust_threshold = v.parse().unwrap_or(config.engine.dust_threshold);
        }
        if let Ok(v) = env::var("PRICE_BUCKET_SECONDS") {
            config.engine.price_bucket_seconds = v.parse().unwrap_or(config.engine.price_bucket_seconds);
        }
        if let Ok(v) = env::var("SERIES_INTERVAL_TAG") {
            config.engine.series_interval_tag = v;
        }

        config.validate();
        config
    }

    fn validate(&mut self) {
        if self.engine.dust_threshold < 0.0 {
            warn!(value = self.engine.dust_threshold, "invalid dust_threshold, using default");
            self.engine.dust_threshold = 0.1;
        }
        if self.engine.price_bucket_seconds <= 0 {
            warn!(value = self.engine.price_bucket_seconds, "invalid price_bucket_seconds, using default");
            self.engine.price_bucket_seconds = 5;
        }
        if self.db.max_connections == 0 {
            warn!("max_connections cannot be 0, using default");
            self.db.max_connections = 10;
        }
    }

    pub fn print_config(&self) {
        info!(
            default_token = %self.engine.default_token,
            default_chain = %self.engine.default_chain,
            dust_threshold = self.engine.dust_threshold,
            price_bucket_seconds = self.engine.price_bucket_seconds,
            series_interval_tag = %self.engine.series_interval_tag,
            max_db_connections = self.db.max_connections,
            "engine configuration loaded"
        );
    }
}
