//! Error taxonomy for the server and its middleware stages.
//!
//! - [`ConfigError`]: malformed or missing configuration, fatal at startup.
//! - [`InitError`]: a stage constructor either reports itself disabled (its config
//!   section is absent) or fails with a configuration problem.
//! - [`ServerError`]: listener, TLS and shutdown failures, delivered over the error
//!   channel returned by [`crate::Server::serve`].
//! - [`PanicError`]: a request handler panic, normalized into an error value and
//!   handed to the [`crate::middleware::ErrorHandler`].

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

/// Result of a middleware stage's init-time checks.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The stage is intentionally inactive. Not a failure.
    #[error("{0} is disabled")]
    Disabled(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl InitError {
    pub fn is_disabled(&self) -> bool {
        matches!(self, InitError::Disabled(_))
    }
}

/// Server lifecycle error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid server configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Server error: {0}")]
    Serve(#[source] io::Error),

    #[error("Shutdown error: {0}")]
    Stop(String),

    #[error("Server is already serving")]
    AlreadyServing,
}

/// A panic recovered from a request handler.
///
/// Panic payloads that are not errors (the usual `&str` or `String` from `panic!`)
/// are wrapped into their message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for PanicError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;

        // The panic message is logged by the recovery stage, never sent to clients.
        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <title>Error {}</title>
</head>
<body>
    <div class="error-page">
        <h1>Error {}</h1>
        <p>Internal server error</p>
    </div>
</body>
</html>"#,
            status.as_u16(),
            status.as_u16(),
        );

        (status, Html(body)).into_response()
    }
}
