//! Configuration management for the sandbox broker
//!
//! Configuration is a single YAML document with one section per collaborator
//! (HTTP server, Docker, oracle, README source, limits). Every field has a
//! default, so an absent file or an empty document yields a working setup.

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::ConfigLoader;
pub use types::*;
