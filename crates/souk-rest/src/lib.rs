//! # Souk REST
//!
//! Read-only HTTP surface using Axum: liveness and readiness probes, queue
//! health reports, Prometheus metrics and the OpenAPI document.

pub mod controllers;
pub mod middleware;
pub mod openapi;
pub mod responses;
pub mod router;
pub mod state;

pub use router::*;
pub use state::*;
