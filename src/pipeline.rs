//! Query execution: validate, admit and reserve, dispatch, reconcile, classify.

use crate::error::{map_error_response, ParseFailure, QueryError};
use crate::ids::LimitId;
use crate::query::{DeferredQuery, Parser};
use crate::registry::{Admission, RateLimitRegistry, UsageUpdate};
use crate::transport::{RequestDescriptor, Transport};
use crate::types::{QueryWeight, RateLimiter};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The service metadata document that publishes rate limiters.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMetadata {
    #[serde(rename = "rateLimits", default)]
    pub rate_limits: Vec<RateLimiter>,
}

/// Entry point for building and running deferred queries against one registry.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<RateLimitRegistry>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    pub fn new(registry: Arc<RateLimitRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                transport,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<RateLimitRegistry> {
        &self.inner.registry
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    pub fn register(&self, limiters: &[RateLimiter], scope: &str) -> Result<Vec<LimitId>, QueryError> {
        Ok(self.inner.registry.register_or_update(limiters, scope)?)
    }

    /// Whether `weights` currently fit. Nothing is reserved.
    pub fn can_afford(&self, weights: &[QueryWeight]) -> Result<bool, QueryError> {
        Ok(self.inner.registry.test_usage(weights)?.is_granted())
    }

    pub fn prepare<R, F>(
        &self,
        request: RequestDescriptor,
        weights: Vec<QueryWeight>,
        parser: F,
    ) -> DeferredQuery<R>
    where
        F: FnOnce(&[u8]) -> Result<R, ParseFailure> + Send + 'static,
    {
        DeferredQuery::new(self.clone(), request, weights, Box::new(parser))
    }

    /// Like [`QueryClient::prepare`] with a JSON body parser.
    pub fn prepare_json<T>(&self, request: RequestDescriptor, weights: Vec<QueryWeight>) -> DeferredQuery<T>
    where
        T: DeserializeOwned + 'static,
    {
        self.prepare(request, weights, |body: &[u8]| {
            serde_json::from_slice::<T>(body).map_err(ParseFailure::from)
        })
    }

    /// Fetch the service metadata document and register its limiters under `scope`.
    pub async fn load_rate_limits(
        &self,
        request: RequestDescriptor,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<LimitId>, QueryError> {
        let metadata = self
            .prepare_json::<ServiceMetadata>(request, Vec::new())
            .execute(cancel)
            .await?;
        info!(
            "service published {} rate limiter(s) for scope {}",
            metadata.rate_limits.len(),
            scope
        );
        self.register(&metadata.rate_limits, scope)
    }

    /// Close the registry; every later execution fails with `Disposed`.
    pub fn shutdown(&self) {
        self.inner.registry.close();
    }
}

fn validate(request: &RequestDescriptor, transport: &dyn Transport) -> Result<(), QueryError> {
    if !request.path.starts_with('/') {
        return Err(QueryError::InputValidation(format!(
            "request path {:?} must start with '/'",
            request.path
        )));
    }
    if request.scope.trim().is_empty() {
        return Err(QueryError::InputValidation("request scope must not be empty".into()));
    }
    if request.params.iter().any(|(name, _)| name.is_empty()) {
        return Err(QueryError::InputValidation("parameter names must not be empty".into()));
    }
    if request.requires_auth && !transport.has_credentials() {
        return Err(QueryError::InputValidation(format!(
            "{} requires authentication but no API key is configured",
            request.path
        )));
    }
    Ok(())
}

pub(crate) async fn run<R>(
    client: &QueryClient,
    request: &RequestDescriptor,
    weights: &[QueryWeight],
    header_map: Option<&HashMap<String, LimitId>>,
    parser: Parser<R>,
    cancel: &CancellationToken,
) -> Result<R, QueryError> {
    let registry = client.registry();
    if registry.is_closed() {
        return Err(QueryError::Disposed);
    }
    validate(request, client.transport())?;
    if cancel.is_cancelled() {
        debug!("{} {} cancelled before admission", request.method, request.path);
        return Err(QueryError::Cancelled);
    }

    // Check and reserve in one step so concurrent queries see each other's cost.
    if let Admission::Denied { limit_id } = registry.try_reserve(weights, registry.now())? {
        let name = registry
            .limit_info(limit_id)
            .map(|info| info.name)
            .unwrap_or_else(|| limit_id.to_string());
        warn!(
            "{} {} not sent: would exceed rate limit {}",
            request.method, request.path, name
        );
        return Err(QueryError::RateLimitPrevention { limit_id });
    }
    debug!("{} {} admission_checked", request.method, request.path);

    // Past this point the service may count the request; the reservation stays.
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("{} {} cancelled while in flight", request.method, request.path);
            return Err(QueryError::Cancelled);
        }
        res = client.transport().send(request) => res?,
    };
    debug!(
        "{} {} sent (success={}, status={:?})",
        request.method, request.path, response.success, response.status
    );

    let timestamp = response.timestamp.unwrap_or_else(|| registry.now());
    let applied = reconcile(registry, &request.scope, header_map, &response.usage, timestamp);
    debug!("{} {} reconciled {} limit(s)", request.method, request.path, applied);

    if response.success {
        parser(&response.content).map_err(|source| {
            warn!("{} {} failed: unparsable response: {}", request.method, request.path, source);
            QueryError::UnknownResponseFormat { source }
        })
    } else {
        let err = map_error_response(response.status, &response.content);
        debug!("{} {} failed: {}", request.method, request.path, err);
        Err(err)
    }
}

/// Apply server-reported usage to the registry. Returns how many limits were updated.
///
/// Names are looked up in `header_map` first, then in the registry's map for
/// `scope`. Unknown names and unparsable values are logged and skipped.
pub fn reconcile(
    registry: &RateLimitRegistry,
    scope: &str,
    header_map: Option<&HashMap<String, LimitId>>,
    usage: &[(String, String)],
    timestamp: DateTime<Utc>,
) -> usize {
    if usage.is_empty() {
        return 0;
    }
    let scope_map = registry.header_map(scope);
    let mut applied = 0;
    for (name, value) in usage {
        let key = name.to_ascii_lowercase();
        let Some(limit_id) = header_map
            .and_then(|map| map.get(&key))
            .or_else(|| scope_map.get(&key))
        else {
            debug!("no rate limit registered for usage header {}", name);
            continue;
        };
        let Ok(level) = value.trim().parse::<u32>() else {
            warn!("ignoring unparsable usage value {:?} for {}", value, name);
            continue;
        };
        match registry.update_usage(*limit_id, level, timestamp) {
            Ok(UsageUpdate::Applied) => applied += 1,
            Ok(UsageUpdate::Stale) => {}
            Err(e) => warn!("could not apply usage from {}: {}", name, e),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::dimension_id;
    use crate::types::{IntervalUnit, RateLimitKind};

    fn registry() -> (RateLimitRegistry, Vec<LimitId>) {
        let registry = RateLimitRegistry::new();
        let ids = registry
            .register_or_update(
                &[
                    RateLimiter::new(RateLimitKind::RequestWeight, IntervalUnit::Minute, 1, 6000),
                    RateLimiter::new(RateLimitKind::Orders, IntervalUnit::Second, 10, 50),
                ],
                "api",
            )
            .unwrap();
        (registry, ids)
    }

    fn usage(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn reconcile_maps_headers_case_insensitively() {
        let (registry, ids) = registry();
        let applied = reconcile(
            &registry,
            "api",
            None,
            &usage(&[("X-MBX-USED-WEIGHT-1M", "17"), ("x-mbx-order-count-10s", "2")]),
            Utc::now(),
        );
        assert_eq!(applied, 2);
        assert_eq!(registry.limit_info(ids[0]).unwrap().usage, 17);
        assert_eq!(registry.limit_info(ids[1]).unwrap().usage, 2);
    }

    #[test]
    fn reconcile_skips_unknown_and_garbage() {
        let (registry, ids) = registry();
        let applied = reconcile(
            &registry,
            "api",
            None,
            &usage(&[("x-mbx-used-weight", "17"), ("x-mbx-used-weight-1m", "lots")]),
            Utc::now(),
        );
        assert_eq!(applied, 0);
        assert_eq!(registry.limit_info(ids[0]).unwrap().usage, 0);
    }

    #[test]
    fn query_header_map_takes_precedence() {
        let (registry, ids) = registry();
        let custom = HashMap::from([("x-mbx-used-weight-1m".to_string(), ids[1])]);
        reconcile(
            &registry,
            "api",
            Some(&custom),
            &usage(&[("x-mbx-used-weight-1m", "9")]),
            Utc::now(),
        );
        assert_eq!(registry.limit_info(ids[1]).unwrap().usage, 9);
        assert_eq!(registry.limit_info(ids[0]).unwrap().usage, 0);
    }

    #[test]
    fn validation_rejects_malformed_requests() {
        struct NoKey;
        #[async_trait::async_trait]
        impl Transport for NoKey {
            async fn send(
                &self,
                _: &RequestDescriptor,
            ) -> Result<crate::transport::TransportResponse, crate::transport::TransportError> {
                unreachable!("validation happens before dispatch")
            }
            fn has_credentials(&self) -> bool {
                false
            }
        }
        let t = NoKey;
        assert!(validate(&RequestDescriptor::get("api/v3/ping"), &t).is_err());
        assert!(validate(&RequestDescriptor::get("/api/v3/ping").in_scope(" "), &t).is_err());
        assert!(validate(&RequestDescriptor::get("/api/v3/ping").param("", 1), &t).is_err());
        assert!(validate(&RequestDescriptor::get("/api/v3/account").signed(), &t).is_err());
        assert!(validate(&RequestDescriptor::get("/api/v3/ping"), &t).is_ok());
    }

    #[test]
    fn can_afford_does_not_reserve() {
        struct Never;
        #[async_trait::async_trait]
        impl Transport for Never {
            async fn send(
                &self,
                _: &RequestDescriptor,
            ) -> Result<crate::transport::TransportResponse, crate::transport::TransportError> {
                Err(crate::transport::TransportError("offline".into()))
            }
        }
        let (registry, ids) = registry();
        let client = QueryClient::new(Arc::new(registry), Arc::new(Never));
        let dim = dimension_id("api", RateLimitKind::RequestWeight);
        assert!(client.can_afford(&[QueryWeight::new(dim, 6000)]).unwrap());
        assert!(!client.can_afford(&[QueryWeight::new(dim, 6001)]).unwrap());
        assert_eq!(client.registry().limit_info(ids[0]).unwrap().usage, 0);
    }
}
