//! Type registry backed by a watch on CustomResourceDefinitions.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use cfghist_core::source::{RegistryError, TypeRegistry};
use cfghist_core::{ResourceTypeDescriptor, TypeVersion};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Cache {
    ready: bool,
    descriptors: BTreeMap<String, ResourceTypeDescriptor>,
}

/// Local cache of registered CRDs. `list` reports `NotReady` until the first
/// full listing has arrived.
#[derive(Debug, Clone, Default)]
pub struct CrdRegistry {
    cache: Arc<RwLock<Cache>>,
}

impl CrdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the CRD watch. `on_change` runs after every add, update, delete
    /// or relist; it is expected to be cheap (enqueue a work item).
    pub fn spawn<F>(&self, client: Client, cancel: CancellationToken, on_change: F) -> JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let registry = self.clone();
        let api: Api<CustomResourceDefinition> = Api::all(client);
        tokio::spawn(async move {
            let mut stream = watcher::watcher(api, watcher::Config::default()).default_backoff().boxed();
            info!("crd watch started");
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(ev)) => {
                        registry.apply(ev);
                        on_change();
                    }
                    Some(Err(e)) => warn!(error = %e, "crd watch error"),
                    None => {
                        warn!("crd watch stream ended");
                        break;
                    }
                }
            }
            debug!("crd watch stopped");
        })
    }

    pub fn is_ready(&self) -> bool {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).ready
    }

    pub(crate) fn apply(&self, ev: Event<CustomResourceDefinition>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match ev {
            Event::Applied(crd) => {
                if let Some(d) = descriptor_from_crd(&crd) {
                    debug!(crd = %d.name, "crd applied");
                    cache.descriptors.insert(d.name.clone(), d);
                }
            }
            Event::Deleted(crd) => {
                if let Some(name) = crd.metadata.name.as_deref() {
                    debug!(crd = %name, "crd deleted");
                    cache.descriptors.remove(name);
                }
            }
            Event::Restarted(crds) => {
                cache.descriptors = crds.iter().filter_map(descriptor_from_crd).map(|d| (d.name.clone(), d)).collect();
                if !cache.ready {
                    info!(crds = cache.descriptors.len(), "crd cache synced");
                }
                cache.ready = true;
            }
        }
    }
}

impl TypeRegistry for CrdRegistry {
    fn list(&self) -> Result<Vec<ResourceTypeDescriptor>, RegistryError> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        if !cache.ready {
            return Err(RegistryError::NotReady);
        }
        Ok(cache.descriptors.values().cloned().collect())
    }
}

pub fn descriptor_from_crd(crd: &CustomResourceDefinition) -> Option<ResourceTypeDescriptor> {
    let name = crd.metadata.name.clone()?;
    Some(ResourceTypeDescriptor {
        name,
        group: crd.spec.group.clone(),
        kind: crd.spec.names.kind.clone(),
        versions: crd.spec.versions.iter().map(|v| TypeVersion { name: v.name.clone(), served: v.served }).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd(plural: &str, group: &str, kind: &str) -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": format!("{plural}.{group}")},
            "spec": {
                "group": group,
                "scope": "Cluster",
                "names": {"plural": plural, "kind": kind},
                "versions": [
                    {"name": "v1", "served": true, "storage": true},
                    {"name": "v1alpha1", "served": false, "storage": false}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn descriptor_carries_group_and_served_flags() {
        let d = descriptor_from_crd(&crd("images", "config.openshift.io", "Image")).unwrap();
        assert_eq!(d.name, "images.config.openshift.io");
        assert_eq!(d.group, "config.openshift.io");
        assert_eq!(d.kind, "Image");
        assert_eq!(
            d.versions,
            vec![
                TypeVersion { name: "v1".into(), served: true },
                TypeVersion { name: "v1alpha1".into(), served: false },
            ]
        );
    }

    #[test]
    fn not_ready_until_first_listing() {
        let reg = CrdRegistry::new();
        assert!(matches!(reg.list(), Err(RegistryError::NotReady)));
        reg.apply(Event::Applied(crd("images", "config.openshift.io", "Image")));
        assert!(matches!(reg.list(), Err(RegistryError::NotReady)));

        reg.apply(Event::Restarted(vec![crd("builds", "config.openshift.io", "Build")]));
        assert!(reg.is_ready());
        let names: Vec<String> = reg.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["builds.config.openshift.io".to_string()]);
    }

    #[test]
    fn applied_and_deleted_update_the_cache() {
        let reg = CrdRegistry::new();
        reg.apply(Event::Restarted(vec![]));
        reg.apply(Event::Applied(crd("images", "config.openshift.io", "Image")));
        reg.apply(Event::Applied(crd("builds", "config.openshift.io", "Build")));
        assert_eq!(reg.list().unwrap().len(), 2);
        reg.apply(Event::Deleted(crd("images", "config.openshift.io", "Image")));
        let names: Vec<String> = reg.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["builds.config.openshift.io".to_string()]);
    }
}
