use crate::ids::{DimensionId, LimitId};
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

/// What a limiter counts, as published by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitKind {
    RawRequests,
    RequestWeight,
    Orders,
}

impl RateLimitKind {
    /// Stable integer encoding used in dimension ids. Never reorder.
    pub fn code(self) -> u32 {
        match self {
            RateLimitKind::RawRequests => 1,
            RateLimitKind::RequestWeight => 2,
            RateLimitKind::Orders => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitKind::RawRequests => "RAW_REQUESTS",
            RateLimitKind::RequestWeight => "REQUEST_WEIGHT",
            RateLimitKind::Orders => "ORDERS",
        }
    }

    fn header_infix(self) -> Option<&'static str> {
        match self {
            RateLimitKind::RawRequests => None,
            RateLimitKind::RequestWeight => Some("used-weight"),
            RateLimitKind::Orders => Some("order-count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl IntervalUnit {
    pub fn seconds(self) -> u64 {
        match self {
            IntervalUnit::Second => 1,
            IntervalUnit::Minute => 60,
            IntervalUnit::Hour => 3_600,
            IntervalUnit::Day => 86_400,
        }
    }

    pub fn suffix(self) -> char {
        match self {
            IntervalUnit::Second => 's',
            IntervalUnit::Minute => 'm',
            IntervalUnit::Hour => 'h',
            IntervalUnit::Day => 'd',
        }
    }
}

/// A capacity rule as published in the service metadata, e.g.
/// `{"rateLimitType":"REQUEST_WEIGHT","interval":"MINUTE","intervalNum":1,"limit":6000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiter {
    #[serde(rename = "rateLimitType")]
    pub kind: RateLimitKind,
    pub interval: IntervalUnit,
    #[serde(rename = "intervalNum")]
    pub interval_count: u32,
    pub limit: u32,
    #[serde(default, rename = "count", skip_serializing_if = "Option::is_none")]
    pub initial_usage: Option<u32>,
}

impl RateLimiter {
    pub fn new(kind: RateLimitKind, interval: IntervalUnit, interval_count: u32, limit: u32) -> Self {
        Self {
            kind,
            interval,
            interval_count,
            limit,
            initial_usage: None,
        }
    }

    pub fn with_initial_usage(mut self, usage: u32) -> Self {
        self.initial_usage = Some(usage);
        self
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.interval.seconds() * u64::from(self.interval_count))
    }

    /// Short window label such as `1m` or `10s`.
    pub fn window_label(&self) -> String {
        format!("{}{}", self.interval_count, self.interval.suffix())
    }

    /// Response header that reports this limiter's live usage, if the service sends one.
    pub fn usage_header(&self, prefix: &str) -> Option<String> {
        let infix = self.kind.header_infix()?;
        Some(format!("{}-{}-{}", prefix, infix, self.window_label()).to_ascii_lowercase())
    }
}

/// Live view of one registered limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit_id: LimitId,
    pub dimension_id: DimensionId,
    #[serde(rename = "reset_interval_secs", serialize_with = "duration_secs")]
    pub reset_interval: Duration,
    pub limit: u32,
    pub usage: u32,
    pub name: String,
}

impl RateLimitInfo {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.usage)
    }
}

fn duration_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Declared cost of one request against one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryWeight {
    pub dimension: DimensionId,
    pub amount: u32,
}

impl QueryWeight {
    pub fn new(dimension: DimensionId, amount: u32) -> Self {
        Self { dimension, amount }
    }

    /// Sum several weight lists per dimension, e.g. to check whether a batch
    /// of deferred queries fits the budget before running any of them.
    pub fn merge<'a, I>(lists: I) -> Vec<QueryWeight>
    where
        I: IntoIterator<Item = &'a [QueryWeight]>,
    {
        let mut merged: Vec<QueryWeight> = Vec::new();
        for weight in lists.into_iter().flatten() {
            match merged.iter_mut().find(|w| w.dimension == weight.dimension) {
                Some(existing) => existing.amount = existing.amount.saturating_add(weight.amount),
                None => merged.push(*weight),
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_service_metadata_entry() {
        let v = serde_json::json!({
            "rateLimitType": "REQUEST_WEIGHT",
            "interval": "MINUTE",
            "intervalNum": 1,
            "limit": 6000
        });
        let limiter: RateLimiter = serde_json::from_value(v).unwrap();
        assert_eq!(limiter.kind, RateLimitKind::RequestWeight);
        assert_eq!(limiter.reset_interval(), Duration::from_secs(60));
        assert_eq!(limiter.initial_usage, None);

        let with_count: RateLimiter = serde_json::from_value(serde_json::json!({
            "rateLimitType": "ORDERS", "interval": "SECOND", "intervalNum": 10,
            "limit": 50, "count": 3
        }))
        .unwrap();
        assert_eq!(with_count.initial_usage, Some(3));
        assert_eq!(with_count.reset_interval(), Duration::from_secs(10));
    }

    #[test]
    fn usage_header_names() {
        let weight = RateLimiter::new(RateLimitKind::RequestWeight, IntervalUnit::Minute, 1, 6000);
        assert_eq!(weight.usage_header("X-MBX").as_deref(), Some("x-mbx-used-weight-1m"));
        let orders = RateLimiter::new(RateLimitKind::Orders, IntervalUnit::Second, 10, 50);
        assert_eq!(orders.usage_header("x-mbx").as_deref(), Some("x-mbx-order-count-10s"));
        let raw = RateLimiter::new(RateLimitKind::RawRequests, IntervalUnit::Minute, 5, 61000);
        assert_eq!(raw.usage_header("x-mbx"), None);
    }

    #[test]
    fn merge_sums_per_dimension_in_first_seen_order() {
        let a = DimensionId(7);
        let b = DimensionId(3);
        let first = [QueryWeight::new(a, 2), QueryWeight::new(b, 1)];
        let second = [QueryWeight::new(b, 4)];
        let merged = QueryWeight::merge([&first[..], &second[..]]);
        assert_eq!(merged, vec![QueryWeight::new(a, 2), QueryWeight::new(b, 5)]);
    }
}
