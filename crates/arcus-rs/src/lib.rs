//! # Arcus-rs API Gateway
//!
//! A multi-tenant reverse proxy and API gateway core built with Rust and
//! Actix Web. Arcus receives HTTP requests, selects a backend (or a group
//! of backends), transforms the request, forwards it, and transforms the
//! response - honoring per-tenant configuration overrides, feature flags,
//! backend health, circuit-breaker state, response caching, and response
//! composition across several backends.
//!
//! ## Core Features
//!
//! ### Routing & backend selection
//! - **Pattern routes**: exact and trailing-`*` wildcard patterns, most
//!   specific match wins
//! - **Round-robin groups**: comma-separated backend lists balanced across
//!   healthy candidates with an atomic counter
//! - **Feature-flag gating**: priority-ordered evaluators with abstention
//!   semantics and alternative-backend fallback
//! - **Tenant overlays**: per-tenant configuration deep-merged onto the
//!   global configuration, with isolated per-tenant proxy handles
//!
//! ### Resilience
//! - **Circuit breakers**: closed/open/half-open per backend, consulted
//!   before every outbound call
//! - **Health checking**: DNS + HTTP probes with recent-request
//!   suppression
//! - **Response cache**: TTL-bounded GET cache keyed by method, tenant,
//!   path, and sorted query
//!
//! ### Composition
//! - **Composite routes**: parallel or sequential fan-out with
//!   deterministic merging or a custom transformer callback
//! - **Map/reduce**: sequential extract-and-enrich and parallel
//!   join-by-field JSON aggregation
//! - **Dry-run**: dual dispatch returning the primary response while the
//!   shadow response is diffed and logged
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│   Arcus Gateway   │──▶│   Backends       │
//! └─────────────┘   │                   │   └──────────────────┘
//!                   │  ┌────────────────┤
//!                   │  │ Routing Engine ││
//!                   │  ├────────────────┤│
//!                   │  │ Transforms     ││
//!                   │  ├────────────────┤│
//!                   │  │ Circuit Break  ││
//!                   │  ├────────────────┤│
//!                   │  │ Health Checker ││
//!                   │  └────────────────┘│
//!                   └───────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - **[`config`]** - configuration loading, validation, tenant merging
//! - **[`models`]** - settings, events, health snapshots, error taxonomy
//! - **[`services`]** - circuit breaker, health checker, cache, flags,
//!   transforms, proxying, routing, composition
//! - **[`module`]** - lifecycle binding everything together
//! - **[`routes`]** - actix-web route registration
//! - **[`logs`]** - logging configuration
//! - **[`utils`]** - pattern matching and path helpers
//!
//! ## Environment Variables
//!
//! - `ARCUS_CONFIG_PATH`: configuration file path (default `./config.json`)
//! - `ARCUS_HOST`: server bind address (default `0.0.0.0`)
//! - `ARCUS_PORT`: server port (default `5900`)
//! - `ARCUS_LOG`: log filter (default `info`)
//! - `NO_COLOR`: disable colored log output

pub mod config;
pub mod logs;
pub mod models;
pub mod module;
pub mod routes;
pub mod services;
pub mod utils;
