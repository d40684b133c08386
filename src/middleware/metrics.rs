//! Prometheus-style request metrics: a counter per (method, endpoint,
//! status, service), a duration histogram, and a gauge of in-flight
//! requests — the three series spec.md §4.12 names for the gateway.
//!
//! `endpoint` is the route's path template (`/api/:service/execute`, not
//! the literal URI) so the cardinality stays bounded regardless of how
//! many distinct services or user ids pass through. `service` is derived
//! from the first path segment after `/api/` when present, `"-"` otherwise.

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

fn service_from_path(path: &str) -> String {
    let mut segments = path.trim_start_matches('/').split('/');
    match segments.next() {
        Some("api") => segments.next().unwrap_or("-").to_string(),
        _ => "-".to_string(),
    }
}

pub async fn request_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let service = service_from_path(&endpoint);

    metrics::gauge!("gateway_active_requests").increment(1.0);
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    metrics::gauge!("gateway_active_requests").decrement(1.0);
    let status = response.status().as_u16().to_string();

    metrics::counter!(
        "gateway_requests_total",
        "method" => method,
        "endpoint" => endpoint,
        "status" => status,
        "service" => service
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds").record(elapsed.as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::service_from_path;

    #[test]
    fn extracts_service_segment() {
        assert_eq!(service_from_path("/api/news/execute"), "news");
        assert_eq!(service_from_path("/api/:service/execute"), ":service");
        assert_eq!(service_from_path("/health"), "-");
    }
}
