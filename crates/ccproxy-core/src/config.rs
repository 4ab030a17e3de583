use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DAILY_ENDPOINT: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const PROD_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const DEFAULT_OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token clients must present.
    pub auth_token: String,
    pub accounts_path: PathBuf,
    pub fallback_enabled: bool,
    pub default_cooldown_ms: u64,
    pub max_accounts: usize,
    /// Above this minimum pool wait the engine falls back or errors instead
    /// of sleeping.
    pub max_wait_before_error_ms: u64,
    pub max_retries: u32,
    pub max_empty_response_retries: u32,
    pub gemini_max_output_tokens: u32,
    pub thinking_signature_ttl_ms: u64,
    /// Ordered upstream hosts; the daily pre-prod host is tried first.
    pub endpoints: Vec<String>,
    pub oauth_token_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            auth_token: "ccproxy".to_string(),
            accounts_path: PathBuf::from("accounts.json"),
            fallback_enabled: true,
            default_cooldown_ms: 10_000,
            max_accounts: 10,
            max_wait_before_error_ms: 120_000,
            max_retries: 5,
            max_empty_response_retries: 2,
            gemini_max_output_tokens: 16_384,
            thinking_signature_ttl_ms: 7_200_000,
            endpoints: vec![DAILY_ENDPOINT.to_string(), PROD_ENDPOINT.to_string()],
            oauth_token_url: DEFAULT_OAUTH_TOKEN_URL.to_string(),
            proxy: None,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_cooldown_ms, 10_000);
        assert_eq!(config.max_accounts, 10);
        assert_eq!(config.max_wait_before_error_ms, 120_000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_empty_response_retries, 2);
        assert_eq!(config.gemini_max_output_tokens, 16_384);
        assert_eq!(config.thinking_signature_ttl_ms, 7_200_000);
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[0].contains("daily"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ProxyConfig = serde_json::from_str(r#"{"port": 9090}"#).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_retries, 5);
    }
}
