use chrono::{TimeZone, Utc};
use reqwest::header::HeaderMap;
use weightgate::http::{build_url, extract_usage_headers, response_timestamp};
use weightgate::pipeline::reconcile;
use weightgate::{IntervalUnit, RateLimitKind, RateLimitRegistry, RateLimiter, RequestDescriptor};

#[test]
fn response_headers_drive_reconciliation() {
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

    let mut h = HeaderMap::new();
    h.insert("X-MBX-USED-WEIGHT-1M", "120".parse().unwrap());
    h.insert("x-mbx-order-count-10s", "3".parse().unwrap());
    h.insert("x-mbx-order-count-1d", "9".parse().unwrap());
    h.insert("content-type", "application/json".parse().unwrap());

    let usage = extract_usage_headers(&h, registry.header_prefix());
    assert_eq!(usage.len(), 3);
    let applied = reconcile(&registry, "api", None, &usage, registry.now());
    // the daily order count has no registered limiter
    assert_eq!(applied, 2);
    assert_eq!(registry.limit_info(ids[0]).unwrap().usage, 120);
    assert_eq!(registry.limit_info(ids[1]).unwrap().usage, 3);
}

#[test]
fn unparsable_usage_value_is_skipped() {
    let registry = RateLimitRegistry::new();
    let ids = registry
        .register_or_update(
            &[RateLimiter::new(RateLimitKind::RequestWeight, IntervalUnit::Minute, 1, 6000)],
            "api",
        )
        .unwrap();
    let usage = vec![("x-mbx-used-weight-1m".to_string(), "lots".to_string())];
    assert_eq!(reconcile(&registry, "api", None, &usage, registry.now()), 0);
    assert_eq!(registry.limit_info(ids[0]).unwrap().usage, 0);
}

#[test]
fn missing_date_header_yields_no_timestamp() {
    let mut h = HeaderMap::new();
    assert_eq!(response_timestamp(&h), None);
    h.insert("date", "Fri, 01 Mar 2024 12:00:05 GMT".parse().unwrap());
    assert_eq!(
        response_timestamp(&h),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap())
    );
}

#[test]
fn base_url_with_prefix_keeps_its_path() {
    let request = RequestDescriptor::get("/api/v3/klines")
        .param("symbol", "ETHBTC")
        .param("interval", "1m");
    let url = build_url("http://localhost:8080/gateway/spot/", &request).unwrap();
    assert_eq!(
        url.as_str(),
        "http://localhost:8080/gateway/spot/api/v3/klines?symbol=ETHBTC&interval=1m"
    );
}
