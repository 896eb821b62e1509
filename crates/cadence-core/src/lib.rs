//! # cadence-core
//!
//! Shared foundation for the Cadence run orchestration engine:
//!
//! - **Typed identifiers**: ULID-backed newtypes that prevent mixing
//!   up runs, deployments, and concurrency limits at compile time
//! - **Observability**: structured-logging bootstrap used by every
//!   engine component and binary

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{DeploymentId, LimitId, RunId};
pub use observability::{init_logging, LogFormat};
