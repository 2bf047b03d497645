//! Config history core types: resource kinds, change events and the
//! capabilities the controller consumes from its environment.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod matcher;
pub mod source;

pub use matcher::ResourceMatcher;
pub use source::EventSourceStream;

/// Group/Version/Kind of a tracked resource type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// File name of the kind's current-state file, e.g. `widget.v1.example.io.yaml`.
    pub fn file_name(&self, ext: &str) -> String {
        let stem = if self.group.is_empty() {
            format!("{}.{}", self.kind, self.version)
        } else {
            format!("{}.{}.{}", self.kind, self.version, self.group)
        };
        format!("{}.{}", stem, ext).to_lowercase()
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeVersion {
    pub name: String,
    pub served: bool,
}

/// A registered resource type definition (a CRD) as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeDescriptor {
    /// Registered name, `<plural>.<group>` for CRDs.
    pub name: String,
    pub group: String,
    pub kind: String,
    pub versions: Vec<TypeVersion>,
}

/// REST mapping needed to list/watch a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceMapping {
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }
}

/// Instance identity: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Object as delivered by a watch, before add/update classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedObject {
    pub id: ObjectId,
    pub resource_version: Option<String>,
    pub body: serde_json::Value,
}

/// Raw output of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Applied(WatchedObject),
    Deleted(WatchedObject),
    /// Full listing: the initial list, or a relist after the watch restarted.
    Listed(Vec<WatchedObject>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Updated,
    Deleted,
}

impl ChangeAction {
    /// Verb used in commit messages.
    pub fn verb(self) -> &'static str {
        match self {
            ChangeAction::Added => "added",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "removes",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Added => "added",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A classified change of one object of a tracked kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub gvk: Gvk,
    pub id: ObjectId,
    /// Serialized object; present for Added/Updated.
    pub body: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn added(gvk: Gvk, id: ObjectId, body: serde_json::Value) -> Self {
        Self { action: ChangeAction::Added, gvk, id, body: Some(body) }
    }

    pub fn updated(gvk: Gvk, id: ObjectId, body: serde_json::Value) -> Self {
        Self { action: ChangeAction::Updated, gvk, id, body: Some(body) }
    }

    pub fn deleted(gvk: Gvk, id: ObjectId) -> Self {
        Self { action: ChangeAction::Deleted, gvk, id, body: None }
    }
}

pub mod prelude {
    pub use super::{
        ChangeAction, ChangeEvent, Gvk, ObjectId, ResourceMapping, ResourceTypeDescriptor, SourceEvent,
        TypeVersion, WatchedObject,
    };
    pub use super::matcher::ResourceMatcher;
    pub use super::source::{EventSource, EventSourceStream, MappingError, MappingResolver, RegistryError, SourceError, TypeRegistry};
}
