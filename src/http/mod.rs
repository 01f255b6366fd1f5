//! Server lifecycle.
//!
//! [`Server`] owns the listener and drives it through
//! Initialized → Serving → Draining → Stopped. It supports three TLS modes:
//! - **None**: Plain HTTP
//! - **Manual**: User-provided certificate and key files
//! - **ACME**: Automatic certificate provisioning via Let's Encrypt
//!
//! The server includes:
//! - Graceful shutdown with a bounded grace period
//! - HTTP to HTTPS redirect (when TLS enabled)
//! - Certificate hot-reload via SIGHUP (manual mode)

mod redirect;
mod server;
pub mod shutdown;

pub use server::{Server, ERROR_CHANNEL_CAPACITY};
