//! # conductor-config
//!
//! TOML configuration schema and loader for the Conductor backend daemon.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::ConductorConfig;
