//! Request logging middleware
//!
//! Author: hephaex@gmail.com

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Log method, endpoint, status and latency of every request
pub async fn log_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let endpoint = normalize_endpoint(request.uri().path());

    let response = next.run(request).await;

    tracing::debug!(
        %method,
        endpoint,
        status = response.status().as_u16(),
        latency_us = start.elapsed().as_micros() as u64,
        "request"
    );
    response
}

/// Replace UUID segments with `:id` so similar requests log alike
fn normalize_endpoint(path: &str) -> String {
    path.split('/')
        .map(|seg| if is_uuid(seg) { ":id" } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_uuid(s: &str) -> bool {
    s.len() == 36
        && s.chars().enumerate().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("/api/v1/submissions/550e8400-e29b-41d4-a716-446655440000"),
            "/api/v1/submissions/:id"
        );
        assert_eq!(normalize_endpoint("/api/v1/leaderboard"), "/api/v1/leaderboard");
        assert!(!is_uuid("550e8400-e29b-41d4-a716-44665544000g"));
    }
}
