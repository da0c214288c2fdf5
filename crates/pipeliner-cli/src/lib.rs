//! # Pipeliner CLI
//!
//! Command-line interface for the Pipeliner build event server.
//!
//! ## Usage
//!
//! ```bash
//! # Serve build event streams
//! pipeliner serve --config pipeliner.yaml
//!
//! # Serve with a sample build to watch
//! pipeliner serve --demo
//! curl -N -H 'Last-Event-ID: 3' localhost:8080/api/v1/builds/1/events
//!
//! # Generate shell completions
//! pipeliner completions --shell bash
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod commands;
pub mod config;
pub mod demo;
pub mod logging;

pub use commands::run;
pub use config::{Config, LogFormat};

/// CLI result type
pub type CliResult<T = ()> = Result<T, anyhow::Error>;
