//! Static header injection and CORS.
//!
//! Request headers from `[http.headers.request]` are appended, so they accumulate
//! with values the client sent. Response headers from `[http.headers.response]`
//! and the CORS headers are defaults: a header the downstream handler sets itself
//! keeps the handler's value. CORS headers replace static ones of the same name,
//! except `Vary`, whose values accumulate.
//!
//! With `[http.headers.cors]` present, `OPTIONS` requests are answered here as
//! preflights and never reach the router.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, VARY,
};

use crate::config::{CorsConfig, HttpConfig};
use crate::error::{ConfigError, InitError};
use crate::registry::Middleware;

pub const NAME: &str = "headers";

type HeaderList = Vec<(HeaderName, HeaderValue)>;

/// CORS header values, validated once at startup. `None` means "not configured",
/// and the header is left out.
#[derive(Debug, Clone, Default)]
struct Cors {
    allowed_origin: Option<HeaderValue>,
    allowed_headers: Option<HeaderValue>,
    allowed_methods: Option<HeaderValue>,
    exposed_headers: Option<HeaderValue>,
    allow_credentials: Option<HeaderValue>,
    max_age: Option<HeaderValue>,
}

#[derive(Debug, Default)]
struct Policy {
    request: HeaderList,
    /// Defaults for responses produced downstream.
    response: HeaderMap,
    /// The full header set of a preflight answer. `None` without CORS.
    preflight: Option<HeaderMap>,
}

#[derive(Debug, Clone)]
pub struct Headers {
    policy: Arc<Policy>,
}

impl Headers {
    /// Build the stage from `[http.headers]`. A missing section disables it.
    pub fn from_config(config: &HttpConfig) -> Result<Self, InitError> {
        let headers = config.headers.as_ref().ok_or(InitError::Disabled(NAME))?;

        let mut response = HeaderMap::new();
        for (name, value) in header_list("http.headers.response", &headers.response)? {
            response.insert(name, value);
        }

        let cors = headers.cors.as_ref().map(Cors::from_config).transpose()?;
        let preflight = cors.as_ref().map(|cors| {
            let mut preflight = response.clone();
            cors.preflight(&mut preflight);
            preflight
        });
        if let Some(cors) = &cors {
            cors.simple(&mut response);
        }

        let policy = Policy {
            request: header_list("http.headers.request", &headers.request)?,
            response,
            preflight,
        };

        Ok(Self {
            policy: Arc::new(policy),
        })
    }
}

impl Middleware for Headers {
    fn name(&self) -> &str {
        NAME
    }

    fn handle(&self, next: Router) -> Router {
        next.layer(middleware::from_fn_with_state(
            Arc::clone(&self.policy),
            apply_headers,
        ))
    }
}

async fn apply_headers(State(policy): State<Arc<Policy>>, mut request: Request, next: Next) -> Response {
    for (name, value) in &policy.request {
        request.headers_mut().append(name.clone(), value.clone());
    }

    let (mut response, defaults) = match &policy.preflight {
        Some(preflight) if request.method() == Method::OPTIONS => {
            (StatusCode::OK.into_response(), preflight)
        }
        _ => (next.run(request).await, &policy.response),
    };

    fill_missing(response.headers_mut(), defaults);
    response
}

/// Copy every header of `defaults` whose name `headers` does not carry yet.
fn fill_missing(headers: &mut HeaderMap, defaults: &HeaderMap) {
    for name in defaults.keys() {
        if headers.contains_key(name) {
            continue;
        }
        for value in defaults.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

impl Cors {
    fn from_config(config: &CorsConfig) -> Result<Self, ConfigError> {
        let value = |field: &str, raw: &str| -> Result<Option<HeaderValue>, ConfigError> {
            if raw.is_empty() {
                return Ok(None);
            }
            HeaderValue::from_str(raw)
                .map(Some)
                .map_err(|e| ConfigError::Validation(format!("Invalid http.headers.cors.{field}: {e}")))
        };

        Ok(Self {
            allowed_origin: value("allowed_origin", &config.allowed_origin)?,
            allowed_headers: value("allowed_headers", &config.allowed_headers)?,
            allowed_methods: value("allowed_methods", &config.allowed_methods)?,
            exposed_headers: value("exposed_headers", &config.exposed_headers)?,
            allow_credentials: config
                .allow_credentials
                .map(|allow| HeaderValue::from_static(if allow { "true" } else { "false" })),
            max_age: (config.max_age > 0).then(|| HeaderValue::from(config.max_age)),
        })
    }

    fn preflight(&self, headers: &mut HeaderMap) {
        headers.append(VARY, HeaderValue::from_static("Origin"));
        headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Method"));
        headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));

        set(headers, ACCESS_CONTROL_ALLOW_ORIGIN, &self.allowed_origin);
        set(headers, ACCESS_CONTROL_ALLOW_HEADERS, &self.allowed_headers);
        set(headers, ACCESS_CONTROL_ALLOW_METHODS, &self.allowed_methods);
        set(headers, ACCESS_CONTROL_ALLOW_CREDENTIALS, &self.allow_credentials);
        set(headers, ACCESS_CONTROL_MAX_AGE, &self.max_age);
    }

    fn simple(&self, headers: &mut HeaderMap) {
        headers.append(VARY, HeaderValue::from_static("Origin"));

        set(headers, ACCESS_CONTROL_ALLOW_ORIGIN, &self.allowed_origin);
        set(headers, ACCESS_CONTROL_ALLOW_HEADERS, &self.allowed_headers);
        set(headers, ACCESS_CONTROL_EXPOSE_HEADERS, &self.exposed_headers);
        set(headers, ACCESS_CONTROL_ALLOW_CREDENTIALS, &self.allow_credentials);
    }
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &Option<HeaderValue>) {
    if let Some(value) = value {
        headers.insert(name, value.clone());
    }
}

fn header_list<'a>(
    section: &str,
    entries: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Result<HeaderList, ConfigError> {
    entries
        .into_iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::Validation(format!("Invalid header name in {section}: '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Validation(format!("Invalid value for {section}.{name}: {e}")))?;
            Ok((name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadersConfig;
    use axum::{body::Body, routing::any};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn config(headers: Option<HeadersConfig>) -> HttpConfig {
        HttpConfig {
            headers,
            ..HttpConfig::default()
        }
    }

    fn cors() -> CorsConfig {
        CorsConfig {
            allowed_origin: "https://a.test".into(),
            max_age: 600,
            ..CorsConfig::default()
        }
    }

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Echoes every value of `x-team` from the request, and counts calls.
    fn router(stage: Headers, calls: Arc<AtomicUsize>) -> Router {
        let routes = Router::new().route(
            "/",
            any(move |headers: HeaderMap| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let teams: Vec<_> = headers
                    .get_all("x-team")
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect();
                ([("x-served-by", "origin")], teams.join(","))
            }),
        );
        stage.handle(routes)
    }

    fn values(headers: &HeaderMap, name: HeaderName) -> Vec<String> {
        headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_disabled_without_section() {
        assert!(Headers::from_config(&config(None)).unwrap_err().is_disabled());
    }

    #[test]
    fn test_invalid_header_name_is_config_error() {
        let headers = HeadersConfig {
            response: map(&[("bad header", "x")]),
            ..HeadersConfig::default()
        };
        let err = Headers::from_config(&config(Some(headers))).unwrap_err();
        assert!(matches!(err, InitError::Config(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = Headers::from_config(&config(Some(HeadersConfig {
            cors: Some(cors()),
            ..HeadersConfig::default()
        })))
        .unwrap();

        let request = http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header("origin", "https://a.test")
            .body(Body::empty())
            .unwrap();
        let response = router(stage, Arc::clone(&calls)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let headers = response.headers();
        assert_eq!(
            values(headers, VARY),
            ["Origin", "Access-Control-Request-Method", "Access-Control-Request-Headers"]
        );
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.test");
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "600");
        assert!(headers.get(ACCESS_CONTROL_ALLOW_METHODS).is_none());
        assert!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
        assert!(headers.get("x-served-by").is_none());
    }

    #[tokio::test]
    async fn test_simple_request_gets_cors_headers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = Headers::from_config(&config(Some(HeadersConfig {
            cors: Some(CorsConfig {
                exposed_headers: "X-Total".into(),
                allow_credentials: Some(false),
                ..cors()
            }),
            ..HeadersConfig::default()
        })))
        .unwrap();

        let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router(stage, Arc::clone(&calls)).oneshot(request).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let headers = response.headers();
        assert_eq!(values(headers, VARY), ["Origin"]);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.test");
        assert_eq!(headers[ACCESS_CONTROL_EXPOSE_HEADERS], "X-Total");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "false");
        assert!(headers.get(ACCESS_CONTROL_MAX_AGE).is_none());
        assert_eq!(headers["x-served-by"], "origin");
    }

    #[tokio::test]
    async fn test_static_headers_without_cors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = Headers::from_config(&config(Some(HeadersConfig {
            request: map(&[("x-team", "edge")]),
            response: map(&[("x-served-by", "frontdoor"), ("x-frame-options", "DENY")]),
            cors: None,
        })))
        .unwrap();

        let request = http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header("x-team", "client")
            .body(Body::empty())
            .unwrap();
        let response = router(stage, Arc::clone(&calls)).oneshot(request).await.unwrap();

        // Without CORS, OPTIONS is routed like any other method.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let headers = response.headers();
        // The handler's own value wins over the static default.
        assert_eq!(values(headers, HeaderName::from_static("x-served-by")), ["origin"]);
        assert_eq!(headers["x-frame-options"], "DENY");
        assert!(headers.get(VARY).is_none());

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"client,edge");
    }

    #[tokio::test]
    async fn test_static_vary_keeps_cors_origin() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = Headers::from_config(&config(Some(HeadersConfig {
            response: map(&[("vary", "Accept-Encoding")]),
            cors: Some(cors()),
            ..HeadersConfig::default()
        })))
        .unwrap();

        let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router(stage.clone(), Arc::clone(&calls)).oneshot(request).await.unwrap();
        assert_eq!(values(response.headers(), VARY), ["Accept-Encoding", "Origin"]);

        let request = http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = router(stage, Arc::clone(&calls)).oneshot(request).await.unwrap();
        assert_eq!(
            values(response.headers(), VARY),
            [
                "Accept-Encoding",
                "Origin",
                "Access-Control-Request-Method",
                "Access-Control-Request-Headers"
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_header_beats_static_default() {
        let stage = Headers::from_config(&config(Some(HeadersConfig {
            response: map(&[("cache-control", "no-store"), ("x-frame-options", "DENY")]),
            ..HeadersConfig::default()
        })))
        .unwrap();
        let routes = Router::new().route(
            "/",
            any(|| async { ([("cache-control", "max-age=60")], "cached") }),
        );

        let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = stage.handle(routes).oneshot(request).await.unwrap();

        let headers = response.headers();
        assert_eq!(values(headers, http::header::CACHE_CONTROL), ["max-age=60"]);
        assert_eq!(headers["x-frame-options"], "DENY");
    }
}
