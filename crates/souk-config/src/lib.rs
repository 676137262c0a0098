//! # Souk Config
//!
//! Configuration management for Souk.
//! Supports layered configuration from files and environment variables,
//! runtime reload, and validation that reports every problem at once.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
