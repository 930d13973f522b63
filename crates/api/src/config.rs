//! Application configuration

use std::env;

use classbook_billing::{GatewayConfig, OrderIdStrategy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,
    pub cors_allowed_origins: Vec<String>,

    // Database (unset runs on the in-memory store)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Payments
    pub enable_payments: bool,
    pub payment_secret_key: String,
    pub payment_api_base: String,
    pub payment_webhook_secret: Option<String>,
    pub order_id_strategy: OrderIdStrategy,
    pub default_currency: String,

    // Billing
    pub billing_tz_offset_hours: i32,

    // Text to speech
    pub tts_api_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub tts_cache_capacity: usize,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let enable_payments = env::var("ENABLE_PAYMENTS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let payment_secret_key = env::var("PAYMENT_SECRET_KEY").unwrap_or_default();
        if enable_payments && payment_secret_key.is_empty() {
            return Err(ConfigError::Missing("PAYMENT_SECRET_KEY"));
        }

        let order_id_strategy = match env::var("ORDER_ID_STRATEGY") {
            Ok(value) => OrderIdStrategy::from_str(&value)
                .ok_or(ConfigError::Invalid("ORDER_ID_STRATEGY must be 'timestamp' or 'uuid'"))?,
            Err(_) => OrderIdStrategy::default(),
        };

        let billing_tz_offset_hours: i32 = env::var("BILLING_TZ_OFFSET_HOURS")
            .unwrap_or_else(|_| "9".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("BILLING_TZ_OFFSET_HOURS must be an integer"))?;
        if !(-12..=14).contains(&billing_tz_offset_hours) {
            return Err(ConfigError::Invalid(
                "BILLING_TZ_OFFSET_HOURS must be between -12 and 14",
            ));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            // Database
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Payments
            enable_payments,
            payment_secret_key,
            payment_api_base: env::var("PAYMENT_API_BASE")
                .unwrap_or_else(|_| "https://api.tosspayments.com".to_string()),
            payment_webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            order_id_strategy,
            default_currency: env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "KRW".to_string()),

            // Billing
            billing_tz_offset_hours,

            // Text to speech
            tts_api_url: env::var("TTS_API_URL").ok().filter(|s| !s.is_empty()),
            tts_api_key: env::var("TTS_API_KEY").ok().filter(|s| !s.is_empty()),
            tts_cache_capacity: env::var("TTS_CACHE_CAPACITY")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),

            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    /// Gateway settings, when payments are enabled
    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        if !self.enable_payments {
            return None;
        }
        Some(GatewayConfig {
            secret_key: self.payment_secret_key.clone(),
            api_base: self.payment_api_base.clone(),
            webhook_secret: self.payment_webhook_secret.clone(),
            app_base_url: self.public_url.clone(),
            currency: self.default_currency.clone(),
        })
    }

    /// Defaults for tests: in-memory store, payments off
    pub fn for_tests() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            public_url: "http://localhost:3000".to_string(),
            cors_allowed_origins: Vec::new(),
            database_url: None,
            database_max_connections: 1,
            enable_payments: false,
            payment_secret_key: String::new(),
            payment_api_base: "http://127.0.0.1:1".to_string(),
            payment_webhook_secret: None,
            order_id_strategy: OrderIdStrategy::Uuid,
            default_currency: "KRW".to_string(),
            billing_tz_offset_hours: 9,
            tts_api_url: None,
            tts_api_key: None,
            tts_cache_capacity: 100,
            log_json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
