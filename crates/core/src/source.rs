//! Capabilities consumed from the control plane.

use futures::stream::BoxStream;

use crate::{Gvk, ResourceMapping, ResourceTypeDescriptor, SourceEvent};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("type registry not ready")]
    NotReady,
    #[error("type registry: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// Kind not present in the cached discovery snapshot yet.
    #[error("no mapping for {0}")]
    NotFound(Gvk),
    #[error("discovery timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("discovery: {0}")]
    Discovery(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("watch {gvk}: {message}")]
    Watch { gvk: Gvk, message: String },
    #[error("decode {gvk}: {message}")]
    Decode { gvk: Gvk, message: String },
}

/// Lists registered resource types. Change notifications are wired by the
/// implementation (the kube registry enqueues the discovery key).
pub trait TypeRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<ResourceTypeDescriptor>, RegistryError>;
}

/// Resolves a kind into its REST mapping from a cached discovery snapshot.
#[async_trait::async_trait]
pub trait MappingResolver: Send + Sync {
    /// Drop the cached snapshot and re-enumerate. Expensive; only call when
    /// there are kinds waiting for a mapping.
    async fn invalidate(&self) -> Result<(), MappingError>;

    fn resolve(&self, gvk: &Gvk) -> Result<ResourceMapping, MappingError>;
}

pub type EventSourceStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// Subscribes to change notifications for one kind: an initial full listing
/// (`SourceEvent::Listed`) followed by individual changes.
pub trait EventSource: Send + Sync + 'static {
    fn watch(&self, mapping: &ResourceMapping) -> EventSourceStream;
}
