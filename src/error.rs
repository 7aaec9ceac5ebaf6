//! Error types for node boot storage provisioning
//!
//! Every reconciler step wraps a failing call with the name of the enclosing
//! operation, so a failure reads as a breadcrumb chain
//! (`create_boot_storage: lun_map: ...`) instead of a stack trace.

use crate::domain::ports::Outcome;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("No aggregates found for vserver {svm}")]
    NoAggregates { svm: String },

    #[error("Insufficient capacity: requested {requested_gib}GiB, largest aggregate {aggregate} has {available_gib}GiB available")]
    InsufficientCapacity {
        aggregate: String,
        requested_gib: u64,
        available_gib: u64,
    },

    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("Ambiguous vserver scope: {candidates} candidates visible, svmName must be configured")]
    AmbiguousScope { candidates: usize },

    // =========================================================================
    // Policy Violations
    // =========================================================================
    #[error("Cannot shrink {kind} {name} from {current_gib}GiB to requested size {requested_gib}GiB")]
    ShrinkRefused {
        kind: String,
        name: String,
        current_gib: u64,
        requested_gib: u64,
    },

    #[error("No {protocol} interfaces found for {target} and subnet {subnet}")]
    UnreachableFabric {
        protocol: String,
        target: String,
        subnet: String,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("{operation} failure [{code}]: {message}")]
    Backend {
        operation: String,
        outcome: Outcome,
        code: String,
        message: String,
    },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    // =========================================================================
    // Content Errors
    // =========================================================================
    #[error("Failure to open {location}: {reasons}")]
    ContentSource { location: String, reasons: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("ISO image error: {0}")]
    IsoImage(String),

    // =========================================================================
    // Breadcrumbs
    // =========================================================================
    #[error("{operation}: {source}")]
    Context {
        operation: String,
        source: Box<Error>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a failure, used by callers to decide whether a
/// re-invocation makes sense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No pool or volume satisfies a size requirement
    Capacity,
    /// A strictly required named resource is absent
    NotFound,
    /// Shrink request or unreachable fabric
    PolicyViolation,
    /// Array reported a failure the adapter did not translate away
    Backend(Outcome),
    /// Network, TLS or authentication failure
    Transport,
    /// Bad input configuration or content
    Configuration,
    Internal,
}

impl Error {
    /// Wrap this error with the name of the enclosing operation
    pub fn context(self, operation: impl Into<String>) -> Self {
        Error::Context {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping breadcrumb layers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Breadcrumb chain, outermost first
    pub fn breadcrumbs(&self) -> Vec<&str> {
        let mut crumbs = Vec::new();
        let mut current = self;
        while let Error::Context { operation, source } = current {
            crumbs.push(operation.as_str());
            current = source;
        }
        crumbs
    }

    /// Classify the root cause of this error
    pub fn class(&self) -> ErrorClass {
        match self.root() {
            Error::NoAggregates { .. } | Error::InsufficientCapacity { .. } => ErrorClass::Capacity,

            Error::NotFound { .. } | Error::AmbiguousScope { .. } => ErrorClass::NotFound,

            Error::ShrinkRefused { .. } | Error::UnreachableFabric { .. } => {
                ErrorClass::PolicyViolation
            }

            Error::Backend { outcome, .. } => ErrorClass::Backend(*outcome),

            Error::Transport(_) | Error::Timeout { .. } => ErrorClass::Transport,

            Error::Configuration(_)
            | Error::ContentSource { .. }
            | Error::Template(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorClass::Configuration,

            _ => ErrorClass::Internal,
        }
    }

    /// Check if this error is transient. Nothing in this crate retries; the
    /// caller decides whether to re-invoke.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transport | ErrorClass::Backend(Outcome::Transient)
        )
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

/// Breadcrumb extension for results
pub trait ResultExt<T> {
    /// Wrap the error, if any, with the enclosing operation name
    fn context(self, operation: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, operation: &str) -> Result<T> {
        self.map_err(|e| e.context(operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breadcrumb_chain() {
        let err: Result<()> = Err(Error::not_found("LUN", "/vol/v/boot"));
        let err = err
            .context("lun_get_info")
            .context("resize_boot_storage")
            .unwrap_err();

        assert_eq!(err.breadcrumbs(), vec!["resize_boot_storage", "lun_get_info"]);
        assert_eq!(
            err.to_string(),
            "resize_boot_storage: lun_get_info: LUN not found: /vol/v/boot"
        );
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_error_classes() {
        let err = Error::InsufficientCapacity {
            aggregate: "aggr1".into(),
            requested_gib: 100,
            available_gib: 10,
        };
        assert_eq!(err.class(), ErrorClass::Capacity);

        let err = Error::ShrinkRefused {
            kind: "boot LUN".into(),
            name: "/vol/v/boot".into(),
            current_gib: 20,
            requested_gib: 10,
        }
        .context("resize");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_backend_outcome() {
        let err = Error::Backend {
            operation: "VolumeCreate".into(),
            outcome: Outcome::Transient,
            code: "503".into(),
            message: "service unavailable".into(),
        };
        assert!(err.is_transient());

        let err = Error::Backend {
            operation: "LunMapCreate".into(),
            outcome: Outcome::Conflict,
            code: "5374922".into(),
            message: "duplicate".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.class(), ErrorClass::Backend(Outcome::Conflict));
    }
}
