//! # Souk Core
//!
//! Foundational types shared by every Souk crate: the unified error type,
//! result aliases and tracing/OpenTelemetry initialization.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig};

// Re-export shaku for dependency injection
pub use shaku::Interface;
