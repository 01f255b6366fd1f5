//! Panic containment.
//!
//! This stage is the single failure-containment boundary of the pipeline: the
//! downstream future is polled inside `catch_unwind`, and its outcome becomes an
//! [`Outcome`] value. Nothing downstream of it can take down the connection task.
//!
//! A panic carrying a broken-pipe or connection-reset `io::Error` means the peer
//! is gone; it is logged and nothing else is attempted. Any other panic is logged
//! with the request and a bounded backtrace, then turned into a response by the
//! configured [`ErrorHandler`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::{poll_fn, Future};
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Once};

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, Version},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use futures::FutureExt;

use crate::error::PanicError;
use crate::registry::Middleware;

pub const NAME: &str = "recovery";

/// Upper bound on the logged backtrace, in bytes.
pub const MAX_STACK_BYTES: usize = 4 << 10;

/// Produces the client-visible response for a recovered panic.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, error: PanicError) -> Response;
}

/// Renders a generic 500 error page.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlErrorHandler;

impl ErrorHandler for HtmlErrorHandler {
    fn handle(&self, error: PanicError) -> Response {
        error.into_response()
    }
}

#[derive(Clone)]
pub struct Recovery {
    error_handler: Arc<dyn ErrorHandler>,
}

impl Recovery {
    pub fn new(error_handler: impl ErrorHandler) -> Self {
        install_trace_hook();
        Self {
            error_handler: Arc::new(error_handler),
        }
    }
}

impl Middleware for Recovery {
    fn name(&self) -> &str {
        NAME
    }

    fn handle(&self, next: Router) -> Router {
        next.layer(middleware::from_fn_with_state(
            Arc::clone(&self.error_handler),
            recover,
        ))
    }
}

/// What came out of the guarded downstream call.
enum Outcome {
    Completed(Response),
    BrokenPipe(io::Error),
    Panicked { error: PanicError, stack: String },
}

async fn guarded(request: Request, next: Next) -> Outcome {
    let mut downstream = pin!(AssertUnwindSafe(next.run(request)).catch_unwind());
    let result = poll_fn(|cx| {
        let _scope = TraceScope::enter();
        downstream.as_mut().poll(cx)
    })
    .await;

    match result {
        Ok(response) => Outcome::Completed(response),
        Err(payload) => {
            let stack = take_trace();
            classify(payload, stack)
        }
    }
}

async fn recover(
    State(error_handler): State<Arc<dyn ErrorHandler>>,
    request: Request,
    next: Next,
) -> Response {
    let line = RequestLine::of(&request);

    match guarded(request, next).await {
        Outcome::Completed(response) => response,
        Outcome::BrokenPipe(error) => {
            tracing::error!(
                error = %error,
                request = %line,
                "{}",
                line.uri.path()
            );
            // Nobody is left to read a body.
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Outcome::Panicked { error, stack } => {
            tracing::error!(
                time = %Utc::now().to_rfc3339(),
                error = %error,
                request = %line,
                stack = %stack,
                "Recovery from panic"
            );
            match std::panic::catch_unwind(AssertUnwindSafe(|| error_handler.handle(error))) {
                Ok(response) => response,
                Err(payload) => {
                    tracing::error!(
                        error = %panic_message(payload.as_ref()),
                        request = %line,
                        "Error handler panicked"
                    );
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

fn classify(payload: Box<dyn Any + Send>, stack: String) -> Outcome {
    if let Some(error) = payload.downcast_ref::<io::Error>() {
        if is_broken_pipe(error) {
            return Outcome::BrokenPipe(io::Error::new(error.kind(), error.to_string()));
        }
    }

    Outcome::Panicked {
        error: PanicError::new(panic_message(payload.as_ref())),
        stack,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(error) = payload.downcast_ref::<io::Error>() {
        error.to_string()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(error) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        error.to_string()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn is_broken_pipe(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    ) || {
        let text = error.to_string().to_lowercase();
        text.contains("broken pipe") || text.contains("connection reset by peer")
    }
}

/// Request line and headers, kept so a panic can be logged after the request
/// itself has been consumed.
struct RequestLine {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl RequestLine {
    fn of(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        }
    }
}

impl std::fmt::Display for RequestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {:?}\r\n", self.method, self.uri, self.version)?;
        for (name, value) in &self.headers {
            write!(f, "{}: {}\r\n", name, value.to_str().unwrap_or("<binary>"))?;
        }
        Ok(())
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
    static IN_GUARDED_POLL: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as polling a guarded future for as long as it lives.
struct TraceScope {
    previous: bool,
}

impl TraceScope {
    fn enter() -> Self {
        let previous = IN_GUARDED_POLL.try_with(|flag| flag.replace(true)).unwrap_or(false);
        Self { previous }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        let _ = IN_GUARDED_POLL.try_with(|flag| flag.set(self.previous));
    }
}

static TRACE_HOOK: Once = Once::new();

/// Record the backtrace of panics raised while a guarded future is polled, so
/// the recovery stage can log where the panic happened rather than where it was
/// caught. Other panics are left alone. The previously installed hook still runs.
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_GUARDED_POLL.try_with(Cell::get).unwrap_or(false) {
                let trace = Backtrace::force_capture().to_string();
                let _ = PANIC_TRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn take_trace() -> String {
    let trace = PANIC_TRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
        .unwrap_or_default();
    truncate(trace, MAX_STACK_BYTES)
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
