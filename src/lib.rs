//! # Tiered Sandbox
//!
//! Runs untrusted scripts at one of four isolation tiers.
//!
//! ## Tiers
//!
//! - **Maximum:** Ephemeral Docker container, no network, read-only root
//! - **High:** Fresh V8 isolate with its own heap ceiling
//! - **Medium:** Restricted embedded QuickJS and Lua interpreters
//! - **Low:** Worker thread inside the host process
//!
//! Every request is checked by a static validator and a resource governor
//! before it reaches a backend. Running executions can be queried and
//! terminated by id.

pub mod config;
pub mod error;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use sandbox::{ExecutionRequest, ExecutionResult, SandboxService};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
