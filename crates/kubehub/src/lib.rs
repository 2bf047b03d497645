//! Config history kubehub: kube-rs implementations of the control plane
//! capabilities (CRD registry, discovery mapper, dynamic-object watches).

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod mapper;
pub mod registry;
pub mod source;

pub use mapper::DiscoveryMapper;
pub use registry::CrdRegistry;
pub use source::KubeEventSource;

/// Client from the in-cluster service account or the local kubeconfig.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster or kubeconfig)")
}

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
