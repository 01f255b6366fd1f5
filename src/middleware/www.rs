//! Bare-domain redirect.
//!
//! A request for a host with exactly two labels (`example.com`) is answered with
//! `301 Moved Permanently` to the same URL on `www.example.com`.
//!
//! The downstream handler still runs for redirected requests. Its body and
//! headers are kept, but the status becomes 301 and `Location` points at the
//! `www.` host.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    Router,
};
use http::header::LOCATION;

use super::request_host;
use crate::registry::Middleware;

pub const NAME: &str = "www";

#[derive(Debug, Clone, Copy, Default)]
pub struct Www;

impl Www {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for Www {
    fn name(&self) -> &str {
        NAME
    }

    fn handle(&self, next: Router) -> Router {
        next.layer(middleware::from_fn(redirect_bare_domain))
    }
}

async fn redirect_bare_domain(request: Request, next: Next) -> Response {
    let location = www_location(&request);

    let mut response = next.run(request).await;

    if let Some(location) = location {
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                tracing::debug!(to = %location, "Redirecting to www host");
                *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
                response.headers_mut().insert(LOCATION, value);
            }
            Err(e) => tracing::warn!(error = %e, "Cannot build www redirect location"),
        }
    }

    response
}

/// The `www.` URL for a two-label host, or `None` for any other host shape.
///
/// The scheme is kept when the request URI carries one; otherwise the location
/// is scheme-relative (`//www.example.com/path`).
fn www_location(request: &Request) -> Option<String> {
    let host = request_host(request);
    if host.split('.').count() != 2 {
        return None;
    }

    let uri = request.uri();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = match uri.scheme_str() {
        Some(scheme) => format!("{scheme}://www.{host}{path_and_query}"),
        None => format!("//www.{host}{path_and_query}"),
    };
    Some(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(calls: Arc<AtomicUsize>) -> Router {
        let routes = Router::new().route(
            "/{*path}",
            get(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                "page"
            }),
        );
        Www::new().handle(routes)
    }

    async fn send(uri: &str, host: &str) -> (Response, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = http::Request::builder()
            .uri(uri)
            .header("host", host)
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&calls)).oneshot(request).await.unwrap();
        (response, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_bare_domain_redirects() {
        let (response, _) = send("http://example.com/docs?lang=en", "example.com").await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "http://www.example.com/docs?lang=en");
    }

    #[tokio::test]
    async fn test_host_header_redirect_is_scheme_relative() {
        let (response, _) = send("/docs", "example.com").await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "//www.example.com/docs");
    }

    #[tokio::test]
    async fn test_subdomain_passes_through() {
        let (response, calls) = send("/docs", "sub.example.com").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(LOCATION).is_none());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_single_label_host_passes_through() {
        let (response, _) = send("/docs", "localhost").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_redirect_still_runs_downstream() {
        let (response, calls) = send("/docs", "example.com").await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(calls, 1);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"page");
    }
}
