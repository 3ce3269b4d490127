//! Client-side admission control for weight-based, rate-limited APIs.
//!
//! A [`QueryClient`] prepares [`DeferredQuery`] values that declare their cost
//! as [`QueryWeight`]s. Executing one checks the [`RateLimitRegistry`],
//! reserves capacity before the request is sent, and afterwards reconciles the
//! local estimate with the usage the server reports.

pub mod config;
pub mod error;
pub mod http;
pub mod ids;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod transport;
pub mod types;

pub use error::{DomainInputReason, ErrorKind, ParseFailure, QueryError};
pub use ids::{dimension_id, limit_id, DimensionId, LimitId};
pub use pipeline::{QueryClient, ServiceMetadata};
pub use query::DeferredQuery;
pub use registry::{Admission, Clock, ManualClock, RateLimitRegistry, RegistryError, SystemClock, UsageUpdate};
pub use transport::{Method, RequestDescriptor, Transport, TransportError, TransportResponse};
pub use types::{IntervalUnit, QueryWeight, RateLimitInfo, RateLimitKind, RateLimiter};
pub use tokio_util::sync::CancellationToken;
