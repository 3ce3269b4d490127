use crate::config::Config;
use crate::transport::{Method, RequestDescriptor, Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::header::{HeaderMap, HeaderValue, DATE, USER_AGENT};
use reqwest::Client;
use std::time::Duration;
use url::Url;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub fn build_client(cfg: &Config) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    // The API key is attached per request so unsigned calls never carry it.
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
}

/// Headers whose name starts with `prefix` (case-insensitive), lower-cased.
pub fn extract_usage_headers(headers: &HeaderMap, prefix: &str) -> Vec<(String, String)> {
    let prefix = prefix.to_ascii_lowercase();
    let mut usage: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with(&prefix))
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect();
    usage.sort();
    usage
}

/// Server time from the `Date` header (RFC 2822 / IMF-fixdate).
pub fn response_timestamp(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get(DATE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// `base` joined with the request path. A path prefix on `base` is kept.
pub fn build_url(base: &str, request: &RequestDescriptor) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)
        .map_err(|e| TransportError(format!("invalid url for {}: {}", request.path, e)))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), request.path);
    url.set_path(&path);
    if !request.params.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url)
}

/// [`Transport`] over reqwest. Performs exactly one HTTP call per request.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    usage_prefix: String,
}

impl ReqwestTransport {
    pub fn new(cfg: &Config) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            api_url: cfg.api_url.clone(),
            api_key: cfg.api_key.clone(),
            usage_prefix: cfg.usage_header_prefix.clone(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<TransportResponse, TransportError> {
        let url = build_url(&self.api_url, request)?;
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        };
        if request.requires_auth {
            if let Some(key) = &self.api_key {
                builder = builder.header(API_KEY_HEADER, key.as_str());
            }
        }

        let res = builder.send().await.map_err(|e| {
            warn!("{} {} error sending request: {}", request.method, request.path, e);
            TransportError(e.to_string())
        })?;

        let status = res.status();
        let headers = res.headers().clone();
        let content = res
            .bytes()
            .await
            .map_err(|e| TransportError(format!("reading response body: {}", e)))?;

        Ok(TransportResponse {
            content: content.to_vec(),
            success: status.is_success(),
            status: Some(status.as_u16()),
            usage: extract_usage_headers(&headers, &self.usage_prefix),
            timestamp: response_timestamp(&headers),
        })
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}
