//! Admission limiter: bounds the number of requests processed at once.
//!
//! Each request holds one semaphore permit for as long as the downstream stages
//! run. The permit is an RAII guard, so it is released on every exit path,
//! including a panic unwinding through this stage. Requests over the limit wait;
//! nothing is rejected and no admission order is promised.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::sync::Semaphore;

use crate::config::HttpConfig;
use crate::error::InitError;
use crate::registry::Middleware;

pub const NAME: &str = "parallel_requests";

#[derive(Debug, Clone)]
pub struct ParallelRequests {
    permits: Arc<Semaphore>,
    max_allowed: usize,
}

impl ParallelRequests {
    /// Build the limiter from `[http.parallel_requests]`.
    ///
    /// A missing section or `max_allowed = 0` disables the stage; a pool with no
    /// permits would block every request forever.
    pub fn from_config(config: &HttpConfig) -> Result<Self, InitError> {
        match config.parallel_requests.as_ref().map(|c| c.max_allowed) {
            None | Some(0) => Err(InitError::Disabled(NAME)),
            Some(max_allowed) => Ok(Self::new(max_allowed)),
        }
    }

    fn new(max_allowed: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_allowed)),
            max_allowed,
        }
    }

    pub fn max_allowed(&self) -> usize {
        self.max_allowed
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Middleware for ParallelRequests {
    fn name(&self) -> &str {
        NAME
    }

    fn handle(&self, next: Router) -> Router {
        next.layer(middleware::from_fn_with_state(Arc::clone(&self.permits), admit))
    }
}

async fn admit(State(permits): State<Arc<Semaphore>>, request: Request, next: Next) -> Response {
    // Held until this function returns or its future is dropped.
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            tracing::error!("Admission pool closed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    next.run(request).await
}
