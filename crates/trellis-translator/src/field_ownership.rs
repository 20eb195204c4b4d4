//! Field ownership bookkeeping
//!
//! Decorators for unrelated features may legally share an output object, but
//! two policies must never silently set the same field of the same object to
//! different values. Every non-idempotent write goes through a
//! [`FieldRegistrar`], which records the owning policy and refuses a second,
//! different owner. The first writer (lowest acceptance order) keeps the
//! field; the caller reports the conflict against the later policy.
//!
//! A registry lives for one destination or mesh translation and is dropped
//! with it.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::reporter::PolicyRef;

/// Dotted path to a field inside an output object, e.g. `spec.http[0].retries`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    /// Wrap a path string
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Append a child segment
    pub fn child(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}.{}", self.0, segment))
        }
    }

    /// Append an index to the last segment
    pub fn index(&self, i: usize) -> Self {
        Self(format!("{}[{}]", self.0, i))
    }

    /// The path as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one output object within a translation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputObjectId {
    /// Output kind (e.g. "VirtualService")
    pub kind: &'static str,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Cluster the object is written to
    pub cluster: String,
}

impl OutputObjectId {
    /// Build an id
    pub fn new(
        kind: &'static str,
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for OutputObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}.{}", self.kind, self.name, self.namespace, self.cluster)
    }
}

/// Two different owners for one field
#[derive(Clone, Debug, Error, PartialEq)]
#[error("field {field} of {object} is already set by {}", format_owners(.existing_owners))]
pub struct FieldConflict {
    /// Object holding the field
    pub object: OutputObjectId,
    /// Contested field
    pub field: FieldPath,
    /// Policies that set the field first
    pub existing_owners: Vec<PolicyRef>,
    /// Policies that tried to set it again
    pub new_owners: Vec<PolicyRef>,
}

fn format_owners(owners: &[PolicyRef]) -> String {
    owners
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Debug)]
struct Ownership {
    owners: Vec<PolicyRef>,
    priority: u32,
}

/// Owner ledger for the fields written during one translation
#[derive(Debug, Default)]
pub struct FieldOwnershipRegistry {
    entries: BTreeMap<(OutputObjectId, FieldPath), Ownership>,
}

impl FieldOwnershipRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owners` as the writers of `field`
    ///
    /// Fails when the field already belongs to a different set of owners.
    /// Re-registration by the same owners replaces the entry. `priority` is
    /// kept with the entry but does not influence the outcome.
    pub fn register_field_ownership(
        &mut self,
        object: &OutputObjectId,
        field: &FieldPath,
        owners: &[PolicyRef],
        priority: u32,
    ) -> Result<(), FieldConflict> {
        let key = (object.clone(), field.clone());
        if let Some(existing) = self.entries.get(&key) {
            if existing.owners != owners {
                return Err(FieldConflict {
                    object: object.clone(),
                    field: field.clone(),
                    existing_owners: existing.owners.clone(),
                    new_owners: owners.to_vec(),
                });
            }
        }
        self.entries.insert(
            key,
            Ownership {
                owners: owners.to_vec(),
                priority,
            },
        );
        Ok(())
    }

    /// Owners of a field, if any
    pub fn owners(&self, object: &OutputObjectId, field: &FieldPath) -> Option<&[PolicyRef]> {
        self.entries
            .get(&(object.clone(), field.clone()))
            .map(|o| o.owners.as_slice())
    }

    /// Priority recorded with a field's ownership
    pub fn priority(&self, object: &OutputObjectId, field: &FieldPath) -> Option<u32> {
        self.entries
            .get(&(object.clone(), field.clone()))
            .map(|o| o.priority)
    }

    /// Number of owned fields
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no field is owned
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Writes fields of one output object on behalf of one policy
///
/// Created by a translator for each (policy, output fragment) pair and handed
/// to decorators; paths passed to [`FieldRegistrar::set`] are relative to the
/// fragment's prefix.
pub struct FieldRegistrar<'a> {
    registry: &'a mut FieldOwnershipRegistry,
    object: OutputObjectId,
    prefix: FieldPath,
    owner: PolicyRef,
    priority: u32,
}

impl<'a> FieldRegistrar<'a> {
    /// Registrar for `owner` writing under `prefix` of `object`
    pub fn new(
        registry: &'a mut FieldOwnershipRegistry,
        object: OutputObjectId,
        prefix: FieldPath,
        owner: PolicyRef,
        priority: u32,
    ) -> Self {
        Self {
            registry,
            object,
            prefix,
            owner,
            priority,
        }
    }

    /// The policy writes are attributed to
    pub fn owner(&self) -> &PolicyRef {
        &self.owner
    }

    /// Set `slot` to `value` unless another policy owns the field
    ///
    /// Equal values are a no-op and register nothing. On conflict the slot is
    /// left untouched.
    pub fn set<T: PartialEq>(
        &mut self,
        field: &str,
        slot: &mut T,
        value: T,
    ) -> Result<(), FieldConflict> {
        if *slot == value {
            return Ok(());
        }
        let path = self.prefix.child(field);
        self.registry.register_field_ownership(
            &self.object,
            &path,
            std::slice::from_ref(&self.owner),
            self.priority,
        )?;
        *slot = value;
        Ok(())
    }
}
