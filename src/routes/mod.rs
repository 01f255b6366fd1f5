//! Built-in route handlers.

pub mod health;

pub use health::Health;
