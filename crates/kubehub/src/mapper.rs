//! Cached discovery snapshot used to resolve kinds into REST mappings.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use cfghist_core::source::{MappingError, MappingResolver};
use cfghist_core::{Gvk, ResourceMapping};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use metrics::histogram;
use tracing::{debug, info};

pub struct DiscoveryMapper {
    client: Client,
    timeout: Duration,
    snapshot: RwLock<BTreeMap<Gvk, ResourceMapping>>,
}

impl DiscoveryMapper {
    /// Starts with an empty snapshot; the first `invalidate` fills it.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout, snapshot: RwLock::new(BTreeMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl MappingResolver for DiscoveryMapper {
    async fn invalidate(&self) -> Result<(), MappingError> {
        let t0 = Instant::now();
        let run = Discovery::new(self.client.clone()).run();
        let discovery = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| MappingError::Timeout(self.timeout))?
            .map_err(|e| MappingError::Discovery(e.to_string()))?;

        let mut snapshot = BTreeMap::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let m = mapping_from(&ar, &caps);
                    snapshot.insert(m.gvk.clone(), m);
                }
            }
        }
        let ms = t0.elapsed().as_millis() as f64;
        histogram!("discovery_refresh_ms", ms);
        info!(kinds = snapshot.len(), took_ms = %ms, "discovery snapshot refreshed");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    fn resolve(&self, gvk: &Gvk) -> Result<ResourceMapping, MappingError> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        match snapshot.get(gvk) {
            Some(m) => Ok(m.clone()),
            None => {
                debug!(gvk = %gvk, "kind not in discovery snapshot");
                Err(MappingError::NotFound(gvk.clone()))
            }
        }
    }
}

pub fn mapping_from(ar: &ApiResource, caps: &ApiCapabilities) -> ResourceMapping {
    ResourceMapping {
        gvk: Gvk::new(ar.group.as_str(), ar.version.as_str(), ar.kind.as_str()),
        plural: ar.plural.clone(),
        namespaced: matches!(caps.scope, Scope::Namespaced),
    }
}

/// Inverse of [`mapping_from`], for building dynamic APIs.
pub fn api_resource(m: &ResourceMapping) -> ApiResource {
    ApiResource {
        group: m.gvk.group.clone(),
        version: m.gvk.version.clone(),
        api_version: m.api_version(),
        kind: m.gvk.kind.clone(),
        plural: m.plural.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_round_trips_through_mapping() {
        let m = ResourceMapping {
            gvk: Gvk::new("config.openshift.io", "v1", "Image"),
            plural: "images".into(),
            namespaced: false,
        };
        let ar = api_resource(&m);
        assert_eq!(ar.api_version, "config.openshift.io/v1");
        assert_eq!(ar.plural, "images");
        let caps = ApiCapabilities { scope: Scope::Cluster, subresources: vec![], operations: vec![] };
        assert_eq!(mapping_from(&ar, &caps), m);
    }

    #[test]
    fn core_group_has_bare_api_version() {
        let m = ResourceMapping { gvk: Gvk::new("", "v1", "ConfigMap"), plural: "configmaps".into(), namespaced: true };
        assert_eq!(api_resource(&m).api_version, "v1");
    }
}
