//! Strongly-typed identifiers for Cadence entities.
//!
//! All identifiers are:
//! - **Strongly typed**: prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: no coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use cadence_core::id::{DeploymentId, RunId};
//!
//! let run = RunId::generate();
//! let deployment = DeploymentId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: DeploymentId = run;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique ID.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }
    };
}

typed_id!(
    /// A unique identifier for a run.
    ///
    /// Runs represent one execution attempt of a flow, or of a task
    /// nested within a flow run.
    RunId,
    "run"
);

typed_id!(
    /// A unique identifier for a deployment.
    ///
    /// Deployments own recurrence definitions; the scheduler
    /// materializes future runs on their behalf.
    DeploymentId,
    "deployment"
);

typed_id!(
    /// A unique identifier for a concurrency limit.
    ///
    /// Limits define named slot pools matched against run tags or
    /// work-pool scopes.
    LimitId,
    "limit"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_string() {
        let id = DeploymentId::generate();
        let parsed: DeploymentId = id.to_string().parse().expect("valid ulid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage() {
        let result: Result<LimitId> = "not-a-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn created_at_is_recent() {
        let id = RunId::generate();
        let age = chrono::Utc::now() - id.created_at();
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn serde_is_transparent() {
        let id = RunId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
