//! Logging configuration and structured output.

pub mod logger;
