//! Health check endpoint for container orchestration.
//!
//! Provides a simple liveness probe that returns 200 OK when the process is running.
//! It only checks that the process can respond to HTTP, so the request still
//! passes through every configured middleware stage.

use axum::{routing::get, Router};

use crate::registry::RouteHandler;

pub const NAME: &str = "health";
pub const PATH: &str = "/health";

#[derive(Debug, Clone, Copy, Default)]
pub struct Health;

impl Health {
    pub fn new() -> Self {
        Self
    }
}

impl RouteHandler for Health {
    fn name(&self) -> &str {
        NAME
    }

    fn register(&self, router: Router) -> Router {
        router.route(PATH, get(health))
    }
}

/// Health check handler.
pub async fn health() -> &'static str {
    "ok"
}
