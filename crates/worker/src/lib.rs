//! Worker process: flags, startup wiring, graceful shutdown.

pub mod app;
pub mod cli;
