//! Access logging.
//!
//! Generates a UUID v4 for each incoming request and creates a tracing span that
//! wraps the rest of the pipeline, so every log emitted while handling the request
//! carries the request_id. When the downstream stages return, one access record
//! is emitted with the status, request metadata and latency.
//!
//! Handlers can extract [`RequestLog`] to log against the request's span
//! explicitly, e.g. from work they spawn onto other tasks.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use chrono::{SecondsFormat, Utc};
use http::header::USER_AGENT;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::request_host;
use crate::registry::Middleware;

pub const NAME: &str = "logging";

/// Request-scoped logging handle, available as a request extension.
#[derive(Clone, Debug)]
pub struct RequestLog {
    pub request_id: Uuid,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl RequestLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for RequestLogger {
    fn name(&self) -> &str {
        NAME
    }

    fn handle(&self, next: Router) -> Router {
        next.layer(middleware::from_fn(access_log))
    }
}

async fn access_log(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let host = request_host(&request);
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
    );

    request.extensions_mut().insert(RequestLog {
        request_id,
        span: span.clone(),
    });

    async move {
        let response = next.run(request).await;
        let latency = start.elapsed();

        tracing::info!(
            status = response.status().as_u16(),
            method = %method,
            host = %host,
            path = %uri.path(),
            query = %uri.query().unwrap_or_default(),
            ip = %ip,
            user_agent = %user_agent,
            latency = ?latency,
            time = %Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "{}",
            uri
        );

        response
    }
    .instrument(span)
    .await
}
