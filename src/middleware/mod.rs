//! Built-in middleware stages.
//!
//! Each stage implements [`Middleware`](crate::Middleware) under the name used in
//! the `http.middleware` list:
//!
//! | name                | stage                                   |
//! |---------------------|-----------------------------------------|
//! | `parallel_requests` | [`ParallelRequests`] admission limiter  |
//! | `recovery`          | [`Recovery`] panic containment          |
//! | `logging`           | [`RequestLogger`] access log            |
//! | `headers`           | [`Headers`] static headers and CORS     |
//! | `www`               | [`Www`] bare-domain redirect            |

mod headers;
mod limiter;
mod logging;
mod recovery;
mod www;

pub use headers::Headers;
pub use limiter::ParallelRequests;
pub use logging::{RequestLog, RequestLogger};
pub use recovery::{ErrorHandler, HtmlErrorHandler, Recovery};
pub use www::Www;

use axum::extract::Request;
use http::header::HOST;

/// Host of the request URI, falling back to the `Host` header.
pub(crate) fn request_host(request: &Request) -> String {
    request
        .uri()
        .authority()
        .map(|a| {
            let authority = a.as_str();
            authority.rsplit('@').next().unwrap_or(authority).to_string()
        })
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}
