//! One long-lived watch per tracked kind, fanned into the history sink.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cfghist_core::{ChangeEvent, EventSourceStream, Gvk, ObjectId, ResourceMapping, SourceEvent};
use cfghist_core::source::EventSource;
use futures::StreamExt;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns raw watch output into Added/Updated/Deleted the way an informer
/// would, by remembering the resource version of every object seen.
#[derive(Debug)]
pub struct Classifier {
    gvk: Gvk,
    known: HashMap<ObjectId, Option<String>>,
}

impl Classifier {
    pub fn new(gvk: Gvk) -> Self {
        Self { gvk, known: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn classify(&mut self, ev: SourceEvent) -> Vec<ChangeEvent> {
        match ev {
            SourceEvent::Applied(o) => {
                let existed = self.known.insert(o.id.clone(), o.resource_version).is_some();
                let gvk = self.gvk.clone();
                if existed {
                    vec![ChangeEvent::updated(gvk, o.id, o.body)]
                } else {
                    vec![ChangeEvent::added(gvk, o.id, o.body)]
                }
            }
            SourceEvent::Deleted(o) => {
                self.known.remove(&o.id);
                vec![ChangeEvent::deleted(self.gvk.clone(), o.id)]
            }
            SourceEvent::Listed(objects) => {
                let mut out = Vec::with_capacity(objects.len());
                let mut seen = HashSet::with_capacity(objects.len());
                for o in objects {
                    seen.insert(o.id.clone());
                    match self.known.get(&o.id) {
                        None => out.push(ChangeEvent::added(self.gvk.clone(), o.id.clone(), o.body)),
                        // Unchanged objects from a relist are not re-recorded.
                        Some(Some(rv)) if o.resource_version.as_deref() == Some(rv.as_str()) => {}
                        Some(_) => out.push(ChangeEvent::updated(self.gvk.clone(), o.id.clone(), o.body)),
                    }
                    self.known.insert(o.id, o.resource_version);
                }
                let mut gone: Vec<ObjectId> = self.known.keys().filter(|id| !seen.contains(*id)).cloned().collect();
                gone.sort();
                for id in gone {
                    self.known.remove(&id);
                    out.push(ChangeEvent::deleted(self.gvk.clone(), id));
                }
                out
            }
        }
    }
}

/// A kind under watch. Never removed once created; a watch whose stream has
/// ended is replaced by the next `start_watch` for its kind.
#[derive(Debug)]
pub struct WatchedKind {
    mapping: ResourceMapping,
    synced: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl WatchedKind {
    pub fn mapping(&self) -> &ResourceMapping {
        &self.mapping
    }

    pub fn gvk(&self) -> &Gvk {
        &self.mapping.gvk
    }

    /// Whether the initial listing has been delivered.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    /// False once the watch task has exited, e.g. because its stream ended.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct WatchManager<S> {
    source: Arc<S>,
    sink: mpsc::Sender<ChangeEvent>,
    kinds: BTreeMap<Gvk, WatchedKind>,
    cancel: CancellationToken,
}

impl<S: EventSource> WatchManager<S> {
    /// `sink` is the history store's fan-in channel.
    pub fn new(source: Arc<S>, sink: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self { source, sink, kinds: BTreeMap::new(), cancel }
    }

    /// Start watching `mapping.gvk`. Starting a kind with a running watch
    /// returns the existing watch; a finished one is restarted.
    pub fn start_watch(&mut self, mapping: ResourceMapping) -> &WatchedKind {
        let gvk = mapping.gvk.clone();
        if !self.is_watching(&gvk) {
            if self.kinds.contains_key(&gvk) {
                counter!("watch_restarts_total", 1u64);
                info!(gvk = %gvk, "restarting finished watch");
            }
            let (synced_tx, synced_rx) = watch::channel(false);
            let stream = self.source.watch(&mapping);
            let task = tokio::spawn(run_watch(
                gvk.clone(),
                stream,
                self.sink.clone(),
                synced_tx,
                self.cancel.child_token(),
            ));
            info!(gvk = %gvk, resource = %mapping.plural, namespaced = mapping.namespaced, "watch started");
            self.kinds.insert(gvk.clone(), WatchedKind { mapping, synced: synced_rx, task });
            gauge!("watches_active", self.kinds.len() as f64);
        }
        &self.kinds[&gvk]
    }

    pub fn has_synced(&self, gvk: &Gvk) -> bool {
        self.kinds.get(gvk).map(WatchedKind::has_synced).unwrap_or(false)
    }

    pub fn is_watching(&self, gvk: &Gvk) -> bool {
        self.kinds.get(gvk).map(WatchedKind::is_running).unwrap_or(false)
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&WatchedKind> {
        self.kinds.get(gvk)
    }

    pub fn watched(&self) -> impl Iterator<Item = &Gvk> {
        self.kinds.keys()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Stop every watch and wait for the tasks to exit. Dropping the manager
    /// releases its handle on the history sink.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.kinds.into_values().map(|k| k.task).collect();
        let count = tasks.len();
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_ok();
        if joined {
            info!(watches = count, "watches stopped");
        } else {
            warn!(watches = count, grace_ms = grace.as_millis() as u64, "watches did not stop within grace period");
        }
        joined
    }
}

async fn run_watch(
    gvk: Gvk,
    mut stream: EventSourceStream,
    sink: mpsc::Sender<ChangeEvent>,
    synced: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut classifier = Classifier::new(gvk.clone());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                let listed = matches!(ev, SourceEvent::Listed(_));
                for change in classifier.classify(ev) {
                    counter!("watch_events_total", 1u64);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = sink.send(change) => {
                            if sent.is_err() {
                                debug!(gvk = %gvk, "history sink closed");
                                return;
                            }
                        }
                    }
                }
                if listed && !*synced.borrow() {
                    synced.send_replace(true);
                    info!(gvk = %gvk, objects = classifier.len(), "watch synced");
                }
            }
            Some(Err(e)) => warn!(gvk = %gvk, error = %e, "watch error"),
            None => {
                warn!(gvk = %gvk, "watch stream ended");
                break;
            }
        }
    }
    debug!(gvk = %gvk, "watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfghist_core::{ChangeAction, WatchedObject};
    use serde_json::json;

    fn obj(name: &str, rv: &str) -> WatchedObject {
        WatchedObject {
            id: ObjectId::cluster(name),
            resource_version: Some(rv.to_string()),
            body: json!({"metadata": {"name": name, "resourceVersion": rv}}),
        }
    }

    fn summary(evs: &[ChangeEvent]) -> Vec<(ChangeAction, String)> {
        evs.iter().map(|e| (e.action, e.id.to_string())).collect()
    }

    #[test]
    fn applied_is_added_then_updated() {
        let mut c = Classifier::new(Gvk::new("example.io", "v1", "Widget"));
        assert_eq!(summary(&c.classify(SourceEvent::Applied(obj("a", "1")))), vec![(ChangeAction::Added, "a".into())]);
        assert_eq!(summary(&c.classify(SourceEvent::Applied(obj("a", "2")))), vec![(ChangeAction::Updated, "a".into())]);
        assert_eq!(summary(&c.classify(SourceEvent::Deleted(obj("a", "2")))), vec![(ChangeAction::Deleted, "a".into())]);
        assert!(c.is_empty());
        assert_eq!(summary(&c.classify(SourceEvent::Applied(obj("a", "3")))), vec![(ChangeAction::Added, "a".into())]);
    }

    #[test]
    fn relist_reports_only_differences() {
        let mut c = Classifier::new(Gvk::new("example.io", "v1", "Widget"));
        let first = c.classify(SourceEvent::Listed(vec![obj("a", "1"), obj("b", "1"), obj("c", "1")]));
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|e| e.action == ChangeAction::Added));

        let relist = c.classify(SourceEvent::Listed(vec![obj("a", "1"), obj("b", "5"), obj("d", "1")]));
        assert_eq!(
            summary(&relist),
            vec![
                (ChangeAction::Updated, "b".into()),
                (ChangeAction::Added, "d".into()),
                (ChangeAction::Deleted, "c".into()),
            ]
        );
        assert!(relist.iter().filter(|e| e.action != ChangeAction::Deleted).all(|e| e.body.is_some()));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn missing_resource_version_is_always_an_update() {
        let mut c = Classifier::new(Gvk::new("example.io", "v1", "Widget"));
        let mut o = obj("a", "1");
        o.resource_version = None;
        c.classify(SourceEvent::Listed(vec![o.clone()]));
        assert_eq!(summary(&c.classify(SourceEvent::Listed(vec![o]))), vec![(ChangeAction::Updated, "a".into())]);
    }
}
