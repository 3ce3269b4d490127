//! Fully specified but unexecuted requests.

use crate::error::{ParseFailure, QueryError};
use crate::ids::LimitId;
use crate::pipeline::{self, QueryClient};
use crate::transport::RequestDescriptor;
use crate::types::QueryWeight;
use log::trace;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

pub(crate) type Parser<R> = Box<dyn FnOnce(&[u8]) -> Result<R, ParseFailure> + Send>;

/// A request bundled with its declared cost and response handling.
///
/// Nothing happens until [`DeferredQuery::execute`] is awaited, so callers can
/// build several queries, inspect or [`QueryWeight::merge`] their weights and
/// decide which ones to run. `execute` consumes the query; dropping it instead
/// releases the parser without touching usage or the network.
pub struct DeferredQuery<R> {
    client: QueryClient,
    request: RequestDescriptor,
    weights: Vec<QueryWeight>,
    parser: Option<Parser<R>>,
    header_map: Option<HashMap<String, LimitId>>,
}

impl<R> DeferredQuery<R> {
    pub(crate) fn new(
        client: QueryClient,
        request: RequestDescriptor,
        weights: Vec<QueryWeight>,
        parser: Parser<R>,
    ) -> Self {
        Self {
            client,
            request,
            weights,
            parser: Some(parser),
            header_map: None,
        }
    }

    /// Reconcile usage through this map instead of the scope's registered one.
    pub fn with_header_map(mut self, map: HashMap<String, LimitId>) -> Self {
        let map = map
            .into_iter()
            .map(|(name, id)| (name.to_ascii_lowercase(), id))
            .collect();
        self.header_map = Some(map);
        self
    }

    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub fn weights(&self) -> &[QueryWeight] {
        &self.weights
    }

    pub async fn execute(mut self, cancel: &CancellationToken) -> Result<R, QueryError> {
        let parser = self
            .parser
            .take()
            .ok_or_else(|| QueryError::InputValidation("query has no response parser".into()))?;
        pipeline::run(
            &self.client,
            &self.request,
            &self.weights,
            self.header_map.as_ref(),
            parser,
            cancel,
        )
        .await
    }

    /// Abandon the query. Equivalent to dropping it.
    pub fn dispose(self) {}
}

impl<R> Drop for DeferredQuery<R> {
    fn drop(&mut self) {
        if self.parser.is_some() {
            trace!(
                "discarding unexecuted query {} {}",
                self.request.method,
                self.request.path
            );
        }
    }
}

impl<R> fmt::Debug for DeferredQuery<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQuery")
            .field("request", &self.request)
            .field("weights", &self.weights)
            .field("executed", &self.parser.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::dimension_id;
    use crate::registry::RateLimitRegistry;
    use crate::transport::{Transport, TransportError, TransportResponse};
    use crate::types::{IntervalUnit, RateLimitKind, RateLimiter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _: &RequestDescriptor) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::ok("{}"))
        }
    }

    fn setup() -> (QueryClient, Arc<CountingTransport>, Vec<LimitId>) {
        let transport = Arc::new(CountingTransport::default());
        let registry = Arc::new(RateLimitRegistry::new());
        let client = QueryClient::new(registry, transport.clone());
        let ids = client
            .register(
                &[RateLimiter::new(RateLimitKind::RequestWeight, IntervalUnit::Minute, 1, 100)],
                "api",
            )
            .unwrap();
        (client, transport, ids)
    }

    #[test]
    fn disposing_unexecuted_query_has_no_effect() {
        let (client, transport, ids) = setup();
        let dim = dimension_id("api", RateLimitKind::RequestWeight);
        let query = client.prepare_json::<serde_json::Value>(
            RequestDescriptor::get("/api/v3/ping"),
            vec![QueryWeight::new(dim, 40)],
        );
        assert_eq!(query.weights(), &[QueryWeight::new(dim, 40)]);
        query.dispose();

        let dropped = client.prepare_json::<serde_json::Value>(
            RequestDescriptor::get("/api/v3/time"),
            vec![QueryWeight::new(dim, 40)],
        );
        drop(dropped);

        assert_eq!(client.registry().limit_info(ids[0]).unwrap().usage, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execute_runs_once_and_reserves() {
        let (client, transport, ids) = setup();
        let dim = dimension_id("api", RateLimitKind::RequestWeight);
        let query = client.prepare_json::<serde_json::Value>(
            RequestDescriptor::get("/api/v3/ping"),
            vec![QueryWeight::new(dim, 5)],
        );
        let value = query.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(value, serde_json::json!({}));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.registry().limit_info(ids[0]).unwrap().usage, 5);
    }

    #[test]
    fn header_map_keys_are_normalised() {
        let (client, _, ids) = setup();
        let query = client
            .prepare_json::<serde_json::Value>(RequestDescriptor::get("/x"), Vec::new())
            .with_header_map(HashMap::from([("X-Custom-Weight".to_string(), ids[0])]));
        assert!(format!("{:?}", query).contains("executed: false"));
        assert_eq!(query.header_map.as_ref().unwrap()["x-custom-weight"], ids[0]);
    }
}
