//! Configuration schema for cleanroom test environments.
//!
//! This crate defines the data the orchestrator is configured with: instance
//! templates (`InstanceConfig` with its `InstanceSource`), the connection
//! parameters for the container runtime (`ClientConfig`), the built-in image
//! sources every run starts with, and the `ConfigStore` that holds them.

pub mod client;
pub mod instance;
pub mod source;
pub mod store;
pub mod types;

pub use client::{ClientConfig, CLIENT_OPTIONS};
pub use instance::{InstanceConfig, InstanceType};
pub use source::{default_sources, InstanceSource, DEFAULT_IMAGE_SERVER};
pub use store::ConfigStore;
pub use types::InstanceName;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "bad instance configuration '{name}': missing required value(s): {}",
        .missing.join(", ")
    )]
    Invalid { name: String, missing: Vec<&'static str> },
    #[error("instance configuration with name '{0}' already exists")]
    Duplicate(String),
    #[error("could not find instance configuration '{0}'")]
    NotFound(String),
    #[error(
        "'{key}' is not a valid client configuration option; valid options are {}",
        CLIENT_OPTIONS.join(", ")
    )]
    UnknownClientOption { key: String },
    #[error("invalid value '{value}' for client configuration option '{key}'")]
    InvalidClientValue { key: String, value: String },
}
