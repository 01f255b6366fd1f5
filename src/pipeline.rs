//! Middleware chain composition.
//!
//! Routes from every registered [`RouteHandler`](crate::RouteHandler) form the
//! terminal router. Configured middleware names are then applied so the first
//! listed stage sees the request first and the response last. Names with no
//! registered stage are skipped, so optional stages may be left out of the build.

use std::sync::OnceLock;

use axum::Router;

use crate::registry::Registry;

/// Compose the registry into one router.
pub fn compose(names: &[String], registry: &Registry) -> Router {
    let mut router = Router::new();

    for (name, handler) in registry.handlers() {
        tracing::info!(handler = %name, "Register handler");
        router = handler.register(router);
    }

    let stages: Vec<_> = names
        .iter()
        .filter_map(|name| match registry.middleware(name) {
            Some(stage) => {
                tracing::info!(middleware = %name, "Register middleware");
                Some(stage)
            }
            None => {
                tracing::debug!(middleware = %name, "Middleware not registered, skipping");
                None
            }
        })
        .collect();

    // `Router::layer` wraps everything added so far, so the last stage applied
    // ends up outermost.
    for stage in stages.iter().rev() {
        router = stage.handle(router);
    }

    router
}

/// A router built at most once, on first use.
#[derive(Default)]
pub struct Pipeline {
    router: OnceLock<Router>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the built router, running `build` only if nothing was built yet.
    /// Concurrent callers block until the single build finishes.
    pub fn get_or_build(&self, build: impl FnOnce() -> Router) -> Router {
        self.router.get_or_init(build).clone()
    }

    pub fn is_built(&self) -> bool {
        self.router.get().is_some()
    }
}
