//! Injection protocol for cleanroom.
//!
//! Packages and artifacts are serialized to JSON, digested with SHA-224,
//! base64-encoded and shipped to an instance together with a POSIX sh
//! bootstrap. The bootstrap recomputes the digest with coreutils before
//! handing the payload to the in-instance agent, which decodes and verifies it
//! again and runs the requested entry point.
//!
//! The digest detects corruption in transit. It is not authentication: anyone
//! able to write the payload can also write a matching checksum.

pub mod agent;
pub mod artifact;
pub mod bootstrap;
pub mod injectable;
pub mod package;

pub use agent::{dispatch, Injected};
pub use artifact::{Artifact, Directory, File};
pub use bootstrap::{AGENT_MISSING_EXIT_CODE, AGENT_PATH, INTEGRITY_EXIT_CODE};
pub use injectable::{digest, Direction, EntryPoint, Injectable, SerializedPayload};
pub use package::{
    Charmlib, Confinement, EnvContribution, EnvValue, Package, PackageSpec, Pip, Snap, System,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("integrity check failed: expected digest {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("{0} already exists; set overwrite to replace it")]
    DestinationExists(PathBuf),
    #[error("{0} not found")]
    SourceNotFound(PathBuf),
    #[error("{path} is a {found}; use {expected} instead")]
    WrongKind {
        path: PathBuf,
        found: &'static str,
        expected: &'static str,
    },
    #[error("nothing to write to {0}: no data has been loaded")]
    NothingToWrite(PathBuf),
    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),
    #[error("invalid package: {0}")]
    InvalidPackage(String),
    #[error("{kind} payload has no {entry} entry point")]
    UnsupportedEntryPoint { kind: &'static str, entry: EntryPoint },
    #[error(transparent)]
    Runtime(#[from] cleanroom_runtime::RuntimeError),
}
