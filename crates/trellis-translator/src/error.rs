//! Diagnostics raised while translating policies
//!
//! None of these abort a pass. They are handed to a [`Reporter`](crate::Reporter)
//! and end up in the status of the policy they are attributed to.

use thiserror::Error;

use crate::field_ownership::FieldConflict;

/// Why a policy cannot be honored at one attachment point
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TranslationError {
    /// The backend has no way to express the feature
    #[error("unsupported feature: {feature}")]
    UnsupportedFeature {
        /// Feature name as it appears in the policy (e.g. "SourceSelector")
        feature: String,
        /// Backend that rejected it
        backend: &'static str,
    },

    /// Another policy already owns an output field with a different value
    #[error("{0}")]
    FieldConflict(#[from] FieldConflict),

    /// A referenced record is not part of the snapshot
    #[error("{kind} {reference} not found")]
    MissingReference {
        /// Kind of the missing record
        kind: String,
        /// Identity key of the missing record
        reference: String,
    },

    /// A policy or workload cannot be mapped to a single identity
    #[error("ambiguous {what}: {message}")]
    Ambiguous {
        /// What could not be pinned down (e.g. "service account")
        what: String,
        /// Details
        message: String,
    },

    /// The policy is internally inconsistent
    #[error("invalid {field}: {message}")]
    InvalidSpec {
        /// Offending field
        field: String,
        /// Details
        message: String,
    },
}

impl TranslationError {
    /// Create an unsupported-feature error
    pub fn unsupported(feature: impl Into<String>, backend: &'static str) -> Self {
        Self::UnsupportedFeature {
            feature: feature.into(),
            backend,
        }
    }

    /// Create a missing-reference error
    pub fn missing(kind: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::MissingReference {
            kind: kind.into(),
            reference: reference.into(),
        }
    }

    /// Create an ambiguity error
    pub fn ambiguous(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ambiguous {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-spec error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            field: field.into(),
            message: message.into(),
        }
    }
}
