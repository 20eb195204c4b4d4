//! Status building blocks shared by every Trellis CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identity::ClusterObjectRef;

/// Outcome of applying a record to one attachment point
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    /// Not yet processed
    #[default]
    Pending,
    /// Selected and translated without reported errors
    Accepted,
    /// Rejected; the errors explain why
    Invalid,
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Per-attachment-point approval of a policy, VirtualMesh or FailoverService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStatus {
    /// Rank among the policies applied to the same attachment point
    #[serde(default)]
    pub acceptance_order: u32,
    /// Current state
    #[serde(default)]
    pub state: ApprovalState,
    /// Reasons for an INVALID state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ApprovalStatus {
    /// An accepted approval at the given rank
    pub fn accepted(acceptance_order: u32) -> Self {
        Self {
            acceptance_order,
            state: ApprovalState::Accepted,
            errors: Vec::new(),
        }
    }

    /// A rejected approval carrying the reported errors
    pub fn invalid(acceptance_order: u32, errors: Vec<String>) -> Self {
        Self {
            acceptance_order,
            state: ApprovalState::Invalid,
            errors,
        }
    }

    /// Whether the state is ACCEPTED
    pub fn is_accepted(&self) -> bool {
        self.state == ApprovalState::Accepted
    }
}

/// A record applied to an attachment point, snapshotted with its generation
///
/// Destinations keep ordered lists of these for traffic and access policies;
/// meshes keep one for the VirtualMesh and a list for FailoverServices.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPolicy<S> {
    /// Identity of the applied record
    #[serde(rename = "ref")]
    pub reference: ClusterObjectRef,
    /// Generation of the record when it was applied
    pub observed_generation: i64,
    /// Spec of the record at that generation
    pub spec: S,
}

/// Overall state of a record that attaches to several meshes
///
/// ACCEPTED only when every selected mesh accepted it; INVALID as soon as
/// one rejected it; PENDING when it selects nothing.
pub fn aggregate_state<'a>(statuses: impl IntoIterator<Item = &'a ApprovalStatus>) -> ApprovalState {
    let mut seen = false;
    for status in statuses {
        seen = true;
        if !status.is_accepted() {
            return ApprovalState::Invalid;
        }
    }
    if seen {
        ApprovalState::Accepted
    } else {
        ApprovalState::Pending
    }
}
