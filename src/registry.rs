//! Registration of middleware stages and route handlers.
//!
//! The composition root owns a [`Registry`] and fills it from any number of
//! initializers, possibly concurrently. The server reads it exactly once, when
//! the pipeline is built; nothing is removed or mutated after that.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;

use crate::error::InitError;

/// A named request-handler decorator.
///
/// `handle` wraps the downstream router with additional behavior and returns the
/// wrapped router, typically via `Router::layer`.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn handle(&self, next: Router) -> Router;
}

/// A source of terminal routes.
pub trait RouteHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn register(&self, router: Router) -> Router;
}

/// Name-keyed middleware stages and route handlers.
///
/// Insertion order of middleware is irrelevant; activation order comes from the
/// configured middleware list. Handlers are registered into the router in the
/// order they were added.
#[derive(Default)]
pub struct Registry {
    middleware: RwLock<HashMap<String, Arc<dyn Middleware>>>,
    handlers: RwLock<Vec<(String, Arc<dyn RouteHandler>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a middleware stage under its name, replacing any previous entry.
    pub fn add_middleware<M: Middleware>(&self, middleware: M) {
        let name = middleware.name().to_string();
        tracing::debug!(middleware = %name, "Middleware added");
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(middleware));
    }

    /// Store the result of a stage constructor.
    ///
    /// A disabled stage is skipped; configuration failures are returned.
    pub fn try_add_middleware<M: Middleware>(
        &self,
        middleware: Result<M, InitError>,
    ) -> Result<(), InitError> {
        match middleware {
            Ok(middleware) => {
                self.add_middleware(middleware);
                Ok(())
            }
            Err(InitError::Disabled(name)) => {
                tracing::debug!(middleware = %name, "Middleware disabled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Store a route handler under its name, replacing any previous entry in place.
    pub fn add_handler<H: RouteHandler>(&self, handler: H) {
        let name = handler.name().to_string();
        tracing::debug!(handler = %name, "Handler added");
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let handler: Arc<dyn RouteHandler> = Arc::new(handler);
        match handlers.iter_mut().find(|entry| entry.0 == name) {
            Some(entry) => entry.1 = handler,
            None => handlers.push((name, handler)),
        }
    }

    pub fn middleware(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of the registered handlers, in registration order.
    pub fn handlers(&self) -> Vec<(String, Arc<dyn RouteHandler>)> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
