use crate::registry::DEFAULT_HEADER_PREFIX;
use std::env;

/// Runtime configuration for the API client.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub usage_header_prefix: String,
    pub metadata_path: String,
    pub scope: String,
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - WEIGHTGATE_API_URL (default: https://api.binance.com)
    /// - WEIGHTGATE_API_KEY (optional; required for signed requests)
    /// - WEIGHTGATE_HTTP_TIMEOUT_SECS (default: 30)
    /// - WEIGHTGATE_USER_AGENT (default: weightgate/<version>)
    /// - WEIGHTGATE_USAGE_HEADER_PREFIX (default: x-mbx)
    /// - WEIGHTGATE_METADATA_PATH (default: /api/v3/exchangeInfo)
    /// - WEIGHTGATE_SCOPE (default: api)
    pub fn from_env() -> Result<Self, String> {
        let api_url = env::var("WEIGHTGATE_API_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());
        url::Url::parse(&api_url)
            .map_err(|e| format!("Invalid WEIGHTGATE_API_URL {:?}: {}", api_url, e))?;

        let api_key = env::var("WEIGHTGATE_API_KEY")
            .ok()
            .filter(|s| !s.is_empty());
        let timeout_secs = env::var("WEIGHTGATE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let user_agent = env::var("WEIGHTGATE_USER_AGENT")
            .unwrap_or_else(|_| format!("weightgate/{}", env!("CARGO_PKG_VERSION")));
        let usage_header_prefix = env::var("WEIGHTGATE_USAGE_HEADER_PREFIX")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|_| DEFAULT_HEADER_PREFIX.to_string());
        let metadata_path = env::var("WEIGHTGATE_METADATA_PATH")
            .unwrap_or_else(|_| "/api/v3/exchangeInfo".to_string());
        let scope = env::var("WEIGHTGATE_SCOPE").unwrap_or_else(|_| "api".to_string());

        Ok(Self {
            api_url,
            api_key,
            user_agent,
            timeout_secs,
            usage_header_prefix,
            metadata_path,
            scope,
        })
    }
}
