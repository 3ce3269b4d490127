//! The boundary to whatever actually moves bytes over the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the transport needs to perform one call.
///
/// `scope` names the capacity pool the endpoint belongs to and selects the
/// usage-header map used for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub requires_auth: bool,
    pub scope: String,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            requires_auth: false,
            scope: String::from("api"),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn signed(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

/// What came back from the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub content: Vec<u8>,
    pub success: bool,
    pub status: Option<u16>,
    /// Usage metadata as reported by the service, e.g. `("x-mbx-used-weight-1m", "12")`.
    pub usage: Vec<(String, String)>,
    /// Server time the response was produced, when known.
    pub timestamp: Option<DateTime<Utc>>,
}

impl TransportResponse {
    pub fn ok(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            success: true,
            status: Some(200),
            ..Self::default()
        }
    }

    pub fn failed(status: u16, content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            success: false,
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.usage.push((name.into(), value.to_string()));
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<TransportResponse, TransportError>;

    /// Whether requests marked `requires_auth` can be sent at all.
    fn has_credentials(&self) -> bool {
        true
    }
}
