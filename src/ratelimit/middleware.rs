use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::RateLimiter;
use crate::server::response::ApiError;

const UNKNOWN_CLIENT: &str = "unknown";

/// Derives the bucket key for a request.
///
/// With `trust_proxy` set, precedence is `X-Real-IP`, then the first entry of
/// `X-Forwarded-For`, then the socket peer address (port stripped).
#[must_use]
pub fn client_key(headers: &HeaderMap, remote: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    remote.map_or_else(|| UNKNOWN_CLIENT.to_string(), |addr| addr.ip().to_string())
}

/// Rejects the request with 429 once the client's bucket is empty.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), remote, limiter.trusts_proxy_headers());

    if !limiter.admit(&key) {
        tracing::warn!(client = %key, "rate limit exceeded");
        return ApiError::rate_limited().into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 54321))
    }

    #[test]
    fn test_real_ip_wins() {
        let h = headers(&[
            ("x-real-ip", "203.0.113.7"),
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
        ]);
        assert_eq!(client_key(&h, peer(), true), "203.0.113.7");
    }

    #[test]
    fn test_first_forwarded_entry() {
        let h = headers(&[("x-forwarded-for", " 198.51.100.1 , 10.0.0.1")]);
        assert_eq!(client_key(&h, peer(), true), "198.51.100.1");
    }

    #[test]
    fn test_peer_address_without_port() {
        assert_eq!(client_key(&HeaderMap::new(), peer(), true), "10.0.0.9");
    }

    #[test]
    fn test_headers_ignored_when_untrusted() {
        let h = headers(&[("x-real-ip", "203.0.113.7")]);
        assert_eq!(client_key(&h, peer(), false), "10.0.0.9");
    }

    #[test]
    fn test_missing_peer() {
        assert_eq!(client_key(&HeaderMap::new(), None, true), "unknown");
    }

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(limiter: Arc<RateLimiter>) -> Router {
        Router::new()
            .route("/test", get(ok))
            .layer(middleware::from_fn_with_state(limiter, enforce))
    }

    fn request_from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/test")
            .header("x-real-ip", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocks_when_over_limit() {
        let limiter = Arc::new(RateLimiter::new(2, 0.001).trust_proxy_headers(true));
        let app = app(limiter);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "rate_limit_exceeded");

        let response = app.oneshot(request_from("2.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_uses_connect_info() {
        let limiter = Arc::new(RateLimiter::new(1, 0.001));
        let app = app(limiter);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);

        let request = || {
            Request::builder()
                .uri("/test")
                .extension(ConnectInfo(addr))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
