//! Process configuration, loaded once at startup from the environment
//! (with `.env` support via dotenv).

use std::env;

use secrecy::SecretString;

const TESTNET_BASE_URL: &str = "https://api.hyperliquid-testnet.xyz";
const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";
const MAINNET_BASE_URL: &str = "https://api.hyperliquid.xyz";
const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub api_key_header: String,
    pub rate_limit_per_minute: u32,
    pub log_level: String,
    pub hyperliquid_testnet: bool,
    pub hyperliquid_base_url: String,
    pub hyperliquid_ws_url: String,
    pub telegram_bot_token: Option<SecretString>,
    pub link_store_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8081,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            api_key_header: "X-API-Key".to_string(),
            rate_limit_per_minute: 100,
            log_level: "info".to_string(),
            hyperliquid_testnet: true,
            hyperliquid_base_url: TESTNET_BASE_URL.to_string(),
            hyperliquid_ws_url: TESTNET_WS_URL.to_string(),
            telegram_bot_token: None,
            link_store_url: None,
        }
    }
}

impl Settings {
    /// Load overrides from environment variables (if set).
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Ok(v) = env::var("ENVIRONMENT") {
            s.environment = v;
        }
        if let Ok(v) = env::var("HOST") {
            s.host = v;
        }
        if let Ok(v) = env::var("PORT") {
            if let Ok(p) = v.parse() {
                s.port = p;
            }
        }
        if let Ok(v) = env::var("CORS_ORIGINS") {
            let origins: Vec<String> = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                s.cors_origins = origins;
            }
        }
        if let Ok(v) = env::var("API_KEY_HEADER") {
            s.api_key_header = v;
        }
        if let Ok(v) = env::var("RATE_LIMIT_PER_MINUTE") {
            if let Ok(n) = v.parse() {
                s.rate_limit_per_minute = n;
            }
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            s.log_level = v.to_lowercase();
        }
        if let Ok(v) = env::var("HYPERLIQUID_TESTNET") {
            s.hyperliquid_testnet = v != "0" && v.to_lowercase() != "false";
        }

        // Network defaults follow the testnet flag; explicit URLs win.
        if !s.hyperliquid_testnet {
            s.hyperliquid_base_url = MAINNET_BASE_URL.to_string();
            s.hyperliquid_ws_url = MAINNET_WS_URL.to_string();
        }
        if let Ok(v) = env::var("HYPERLIQUID_BASE_URL") {
            s.hyperliquid_base_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = env::var("HYPERLIQUID_WS_URL") {
            s.hyperliquid_ws_url = v;
        }

        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN") {
            if !v.is_empty() {
                s.telegram_bot_token = Some(SecretString::from(v));
            }
        }
        if let Ok(v) = env::var("LINK_STORE_URL") {
            if !v.is_empty() {
                s.link_store_url = Some(v.trim_end_matches('/').to_string());
            }
        }

        s
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_point_at_testnet() {
        let s = Settings::default();
        assert!(s.hyperliquid_testnet);
        assert!(s.hyperliquid_base_url.contains("testnet"));
        assert!(s.hyperliquid_ws_url.starts_with("wss://"));
        assert_eq!(s.bind_addr(), "127.0.0.1:8081");
    }
}
