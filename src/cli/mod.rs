//! CLI module
//!
//! Command-line arguments and the engine configuration they override.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{Config, ProxyConfig};
