//! # Souk Server Library
//!
//! Wiring for the Souk worker process. Applications that bring their own
//! handlers build on [`app::AppBuilder`]; the `souk-server` binary is the
//! same builder with nothing registered beyond configuration.

pub mod app;
pub mod di;
pub mod startup;
