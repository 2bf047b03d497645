#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use cfghist_core::prelude::*;
use futures::StreamExt;
use tokio::sync::mpsc;

pub fn descriptor(plural: &str, group: &str, kind: &str, versions: &[(&str, bool)]) -> ResourceTypeDescriptor {
    ResourceTypeDescriptor {
        name: format!("{plural}.{group}"),
        group: group.to_string(),
        kind: kind.to_string(),
        versions: versions.iter().map(|(n, s)| TypeVersion { name: n.to_string(), served: *s }).collect(),
    }
}

pub fn mapping(gvk: &Gvk) -> ResourceMapping {
    ResourceMapping { gvk: gvk.clone(), plural: format!("{}s", gvk.kind.to_lowercase()), namespaced: false }
}

#[derive(Default)]
pub struct FakeRegistry {
    pub descriptors: Mutex<Vec<ResourceTypeDescriptor>>,
}

impl FakeRegistry {
    pub fn register(&self, d: ResourceTypeDescriptor) {
        self.descriptors.lock().unwrap().push(d);
    }
}

impl TypeRegistry for FakeRegistry {
    fn list(&self) -> Result<Vec<ResourceTypeDescriptor>, RegistryError> {
        Ok(self.descriptors.lock().unwrap().clone())
    }
}

/// Serves mappings known to the "server" once the cache has been invalidated.
#[derive(Default)]
pub struct CountingResolver {
    pub invalidations: AtomicUsize,
    pub server: Mutex<BTreeMap<Gvk, ResourceMapping>>,
    cache: Mutex<BTreeMap<Gvk, ResourceMapping>>,
    hang: AtomicBool,
}

impl CountingResolver {
    pub fn publish(&self, gvk: &Gvk) {
        self.server.lock().unwrap().insert(gvk.clone(), mapping(gvk));
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Every later `invalidate` never returns, like an unresponsive API server.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MappingResolver for CountingResolver {
    async fn invalidate(&self) -> Result<(), MappingError> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let snapshot = self.server.lock().unwrap().clone();
        *self.cache.lock().unwrap() = snapshot;
        Ok(())
    }

    fn resolve(&self, gvk: &Gvk) -> Result<ResourceMapping, MappingError> {
        self.cache.lock().unwrap().get(gvk).cloned().ok_or_else(|| MappingError::NotFound(gvk.clone()))
    }
}

pub type FeedTx = mpsc::UnboundedSender<Result<SourceEvent, SourceError>>;

/// Watch streams fed by the test. Kinds without a feed never list.
#[derive(Default)]
pub struct FakeSource {
    feeds: Mutex<HashMap<Gvk, mpsc::UnboundedReceiver<Result<SourceEvent, SourceError>>>>,
}

impl FakeSource {
    pub fn feed(&self, gvk: &Gvk) -> FeedTx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(gvk.clone(), rx);
        tx
    }
}

impl EventSource for FakeSource {
    fn watch(&self, mapping: &ResourceMapping) -> EventSourceStream {
        match self.feeds.lock().unwrap().remove(&mapping.gvk) {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

pub fn object(name: &str, rv: &str, body: serde_json::Value) -> WatchedObject {
    WatchedObject { id: ObjectId::cluster(name), resource_version: Some(rv.to_string()), body }
}
