//! Dynamic-object watches for tracked kinds.

use cfghist_core::source::{EventSource, SourceError};
use cfghist_core::{EventSourceStream, Gvk, ObjectId, ResourceMapping, SourceEvent, WatchedObject};
use futures::StreamExt;
use kube::api::Api;
use kube::core::{DynamicObject, TypeMeta};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;

use crate::mapper::api_resource;
use crate::strip_managed_fields;

/// Watches every namespace of a kind through the dynamic API.
#[derive(Clone)]
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EventSource for KubeEventSource {
    fn watch(&self, mapping: &ResourceMapping) -> EventSourceStream {
        let ar = api_resource(mapping);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let gvk = mapping.gvk.clone();
        let types = TypeMeta { api_version: mapping.api_version(), kind: mapping.gvk.kind.clone() };
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |ev| match ev {
                Ok(ev) => source_event(&gvk, &types, ev),
                Err(e) => Err(SourceError::Watch { gvk: gvk.clone(), message: e.to_string() }),
            })
            .boxed()
    }
}

pub fn source_event(gvk: &Gvk, types: &TypeMeta, ev: Event<DynamicObject>) -> Result<SourceEvent, SourceError> {
    match ev {
        Event::Applied(o) => Ok(SourceEvent::Applied(watched_object(gvk, types, o)?)),
        Event::Deleted(o) => Ok(SourceEvent::Deleted(watched_object(gvk, types, o)?)),
        Event::Restarted(list) => {
            let objects = list.into_iter().map(|o| watched_object(gvk, types, o)).collect::<Result<Vec<_>, _>>()?;
            Ok(SourceEvent::Listed(objects))
        }
    }
}

/// List items come back without apiVersion/kind; fill them in so the stored
/// document is self-describing.
pub fn watched_object(gvk: &Gvk, types: &TypeMeta, mut obj: DynamicObject) -> Result<WatchedObject, SourceError> {
    if obj.types.is_none() {
        obj.types = Some(types.clone());
    }
    let id = ObjectId::new(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or_default());
    let resource_version = obj.metadata.resource_version.clone();
    let mut body = serde_json::to_value(&obj)
        .map_err(|e| SourceError::Decode { gvk: gvk.clone(), message: e.to_string() })?;
    strip_managed_fields(&mut body);
    Ok(WatchedObject { id, resource_version, body })
}
