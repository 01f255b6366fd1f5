//! Frontdoor - an extensible HTTP/HTTPS front-end.
//!
//! Route handlers and named middleware stages are registered on a [`Registry`];
//! the configured middleware list decides which stages run and in what order.
//! [`Server`] composes them into one axum router and runs it over plain HTTP,
//! user-provided certificates, or ACME-issued certificates.

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod routes;

#[cfg(test)]
mod test_support;

pub use config::{AppConfig, HttpConfig, TlsMode};
pub use error::{ConfigError, InitError, PanicError, ServerError};
pub use crate::http::Server;
pub use registry::{Middleware, Registry, RouteHandler};
