//! Config history store: turns change events into an append-only git log with
//! one current-state file per tracked kind.
//!
//! All mutation goes through [`HistoryStore::record`], which takes `&mut self`;
//! [`spawn_writer`] owns the store on a single consumer task so that exactly one
//! commit is in flight and commits land in the order events were received.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use cfghist_core::{ChangeAction, ChangeEvent, Gvk};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod backend;
pub mod git;

pub use backend::{
    commit_message, format_reference_listing, parse_commit_message, Identity, Reference, RevisionId,
    RevisionRecord, StoreError, VcsBackend,
};
pub use git::{blob_hash, GitBackend};

pub const SYSTEM_IDENTITY: &str = "config-history-operator";
pub const COMPONENT_IDENTITY: &str = "operator";
pub const DEFAULT_COMMIT_DOMAIN: &str = "openshift.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Author of every commit (the system).
    pub author: Identity,
    /// Committer of every commit (the component that observed the change).
    pub committer: Identity,
    /// Extension of current-state files.
    pub extension: String,
}

impl HistoryConfig {
    pub fn with_domain(domain: &str) -> Self {
        Self {
            author: Identity::component(SYSTEM_IDENTITY, domain),
            committer: Identity::component(COMPONENT_IDENTITY, domain),
            extension: "yaml".to_string(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::with_domain(DEFAULT_COMMIT_DOMAIN)
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: RevisionId,
    pub path: String,
    pub action: ChangeAction,
    pub message: String,
}

pub struct HistoryStore<B> {
    backend: B,
    cfg: HistoryConfig,
}

impl<B: VcsBackend> HistoryStore<B> {
    pub fn new(backend: B, cfg: HistoryConfig) -> Self {
        Self { backend, cfg }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.cfg
    }

    pub fn path_for(&self, gvk: &Gvk) -> String {
        gvk.file_name(&self.cfg.extension)
    }

    /// Write (or remove) the kind's current-state file, commit, and refresh
    /// the reference listing.
    pub fn record(&mut self, ev: &ChangeEvent) -> Result<Revision, StoreError> {
        let path = self.path_for(&ev.gvk);
        match ev.action {
            ChangeAction::Added | ChangeAction::Updated => {
                let body = ev.body.as_ref().ok_or_else(|| StoreError::MissingBody { path: path.clone() })?;
                let content = encode(&path, body)?;
                self.backend.write_file(&path, &content)?;
            }
            ChangeAction::Deleted => self.backend.remove_file(&path)?,
        }
        let message = commit_message(&path, ev.action);
        let id = self.backend.commit(&message, &self.cfg.author, &self.cfg.committer)?;
        // The commit is durable at this point; a stale listing heals on the next commit.
        if let Err(e) = self.refresh_reference_listing() {
            warn!(path = %path, error = %e, "unable to refresh reference listing");
        }
        Ok(Revision { id, path, action: ev.action, message })
    }

    /// [`record`](Self::record) with failures logged and dropped.
    pub fn apply(&mut self, ev: ChangeEvent) -> Option<Revision> {
        let started = Instant::now();
        match self.record(&ev) {
            Ok(rev) => {
                histogram!("history_commit_ms", started.elapsed().as_secs_f64() * 1000.0);
                counter!("history_commits_total", 1u64);
                info!(path = %rev.path, object = %ev.id, action = %ev.action, commit = %rev.id, "change committed");
                Some(rev)
            }
            Err(e) => {
                counter!("history_commit_failures_total", 1u64);
                warn!(path = %self.path_for(&ev.gvk), object = %ev.id, action = %ev.action, error = %e, "unable to record change");
                None
            }
        }
    }

    pub fn refresh_reference_listing(&mut self) -> Result<(), StoreError> {
        let refs = self.backend.list_references()?;
        self.backend.publish_reference_listing(&format_reference_listing(&refs))
    }

    /// Current serialized state of a kind; `None` when absent or deleted.
    pub fn current(&self, gvk: &Gvk) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.read_file(&self.path_for(gvk))
    }

    pub fn history(&self) -> Result<Vec<RevisionRecord>, StoreError> {
        self.backend.history()
    }
}

/// Canonical file representation of an object body: YAML with keys sorted at
/// every level, independent of the order the body was built in.
pub fn encode(path: &str, body: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
    serde_yaml::to_string(&sorted(body))
        .map(String::into_bytes)
        .map_err(|source| StoreError::Encode { path: path.to_string(), source })
}

fn sorted(v: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Handle to the writer task returned by [`spawn_writer`].
pub struct WriterHandle<B> {
    processed: watch::Receiver<u64>,
    task: JoinHandle<HistoryStore<B>>,
}

impl<B> WriterHandle<B> {
    /// Count of change events the writer has finished handling.
    pub fn processed(&self) -> watch::Receiver<u64> {
        self.processed.clone()
    }

    /// Wait for the writer to drain. Completes once every sender is dropped
    /// and queued events are committed; returns the store.
    pub async fn join(self, grace: Duration) -> Result<HistoryStore<B>, StoreError> {
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(store)) => Ok(store),
            Ok(Err(e)) => Err(StoreError::Writer(e.to_string())),
            Err(_) => Err(StoreError::DrainTimeout(grace)),
        }
    }
}

/// Run the store on a single blocking consumer. The returned sender is the
/// fan-in point for every watch.
pub fn spawn_writer<B>(store: HistoryStore<B>, cap: usize) -> (mpsc::Sender<ChangeEvent>, WriterHandle<B>)
where
    B: VcsBackend + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ChangeEvent>(cap.max(1));
    let (processed_tx, processed_rx) = watch::channel(0u64);
    let task = tokio::task::spawn_blocking(move || {
        let mut store = store;
        while let Some(ev) = rx.blocking_recv() {
            store.apply(ev);
            processed_tx.send_modify(|n| *n += 1);
        }
        debug!("change channel closed; writer exiting");
        store
    });
    (tx, WriterHandle { processed: processed_rx, task })
}
