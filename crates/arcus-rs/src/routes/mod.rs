//! HTTP route definitions and handlers.

pub mod debug;
pub mod health;
pub mod http;
