use std::fmt;
use std::path::PathBuf;

use cfghist_core::ChangeAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Commit hash assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionId(pub String);

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    /// `name <name@domain>`
    pub fn component(name: &str, domain: &str) -> Self {
        Self { name: name.to_string(), email: format!("{}@{}", name, domain) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub id: RevisionId,
}

/// One committed entry of the history log, as read back from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: RevisionId,
    /// Target file; empty for commits not written by the store.
    pub path: String,
    pub action: Option<ChangeAction>,
    pub message: String,
    pub author: Identity,
    pub committer: Identity,
    pub timestamp: DateTime<Utc>,
    /// Content hash of `path` in the commit tree; `None` for tombstones.
    pub blob: Option<String>,
}

impl RevisionRecord {
    pub fn is_tombstone(&self) -> bool {
        self.action == Some(ChangeAction::Deleted) && self.blob.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("encode {path}: {source}")]
    Encode { path: String, source: serde_yaml::Error },
    #[error("{path}: event carries no object body")]
    MissingBody { path: String },
    #[error("{op} {path}: {source}")]
    Io { op: &'static str, path: String, source: std::io::Error },
    #[error("repository at {0} has no working tree")]
    Bare(PathBuf),
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("backend: {0}")]
    Backend(String),
    #[error("writer did not drain within {0:?}")]
    DrainTimeout(std::time::Duration),
    #[error("writer task failed: {0}")]
    Writer(String),
}

/// Transactional version-control primitives the history store is built on.
/// Implementations are driven from a single writer and need not be `Sync`.
pub trait VcsBackend {
    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), StoreError>;

    /// Removing an absent file is not an error.
    fn remove_file(&mut self, path: &str) -> Result<(), StoreError>;

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn commit(&mut self, message: &str, author: &Identity, committer: &Identity) -> Result<RevisionId, StoreError>;

    /// Direct (non-symbolic) references, sorted by name.
    fn list_references(&self) -> Result<Vec<Reference>, StoreError>;

    /// Replace the listing read by dumb-protocol clients.
    fn publish_reference_listing(&mut self, listing: &[u8]) -> Result<(), StoreError>;

    /// Newest first.
    fn history(&self) -> Result<Vec<RevisionRecord>, StoreError>;
}

/// Message written for a change of `path`: `"<path>" <verb>`.
pub fn commit_message(path: &str, action: ChangeAction) -> String {
    format!("{:?} {}", path, action.verb())
}

/// Inverse of [`commit_message`].
pub fn parse_commit_message(message: &str) -> Option<(String, ChangeAction)> {
    let rest = message.trim_end().strip_prefix('"')?;
    let (path, verb) = rest.rsplit_once("\" ")?;
    let action = match verb {
        "added" => ChangeAction::Added,
        "updated" => ChangeAction::Updated,
        "removes" => ChangeAction::Deleted,
        _ => return None,
    };
    Some((path.to_string(), action))
}

/// `info/refs` body: one `<id>\t<name>` line per reference.
pub fn format_reference_listing(refs: &[Reference]) -> Vec<u8> {
    let mut out = String::new();
    for r in refs {
        out.push_str(&r.id.0);
        out.push('\t');
        out.push_str(&r.name);
        out.push('\n');
    }
    out.into_bytes()
}
