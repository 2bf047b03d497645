//! git2-backed [`VcsBackend`].

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{Commit, ErrorCode, ObjectType, Oid, Repository, Signature};
use tracing::{debug, info};

use crate::backend::{
    parse_commit_message, Identity, Reference, RevisionId, RevisionRecord, StoreError, VcsBackend,
};

pub struct GitBackend {
    repo: Repository,
    workdir: PathBuf,
}

impl GitBackend {
    /// Open the repository at `path`, initializing one when there is none.
    pub fn open_or_init(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                info!(path = %path.display(), "no repository found, initializing");
                Repository::init(path)?
            }
            Err(e) => return Err(e.into()),
        };
        let workdir = repo.workdir().ok_or_else(|| StoreError::Bare(path.to_path_buf()))?.to_path_buf();
        debug!(workdir = %workdir.display(), "repository opened");
        Ok(Self { repo, workdir })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// The `.git` directory served to dumb-protocol clients.
    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>, StoreError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn pack_listing(&self) -> Result<Vec<u8>, StoreError> {
        let dir = self.git_dir().join("objects").join("pack");
        let mut packs = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.ends_with(".pack") {
                        packs.push(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("list packs", &dir, e)),
        }
        packs.sort();
        let mut out = String::new();
        for p in packs {
            out.push_str("P ");
            out.push_str(&p);
            out.push('\n');
        }
        out.push('\n');
        Ok(out.into_bytes())
    }
}

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { op, path: path.display().to_string(), source }
}

/// Replace `path` by renaming a sibling temp file over it, so concurrent
/// readers see either the old or the new contents.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("create temp", dir, e))?;
    tmp.write_all(contents).map_err(|e| io_err("write", tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_err("sync", tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_err("rename", path, e.error))?;
    Ok(())
}

fn identity(sig: &Signature<'_>) -> Identity {
    Identity {
        name: sig.name().unwrap_or_default().to_string(),
        email: sig.email().unwrap_or_default().to_string(),
    }
}

impl VcsBackend for GitBackend {
    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), StoreError> {
        let full = self.workdir.join(path);
        std::fs::write(&full, contents).map_err(|e| io_err("write", &full, e))?;
        let mut index = self.repo.index()?;
        index.add_path(Path::new(path))?;
        index.write()?;
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<(), StoreError> {
        let full = self.workdir.join(path);
        match std::fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path, "file already absent");
            }
            Err(e) => return Err(io_err("remove", &full, e)),
        }
        let mut index = self.repo.index()?;
        index.remove_path(Path::new(path))?;
        index.write()?;
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let full = self.workdir.join(path);
        match std::fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read", &full, e)),
        }
    }

    fn commit(&mut self, message: &str, author: &Identity, committer: &Identity) -> Result<RevisionId, StoreError> {
        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let author = Signature::now(&author.name, &author.email)?;
        let committer = Signature::now(&committer.name, &committer.email)?;
        let parent = self.head_commit()?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self.repo.commit(Some("HEAD"), &author, &committer, message, &tree, &parents)?;
        Ok(RevisionId(oid.to_string()))
    }

    fn list_references(&self) -> Result<Vec<Reference>, StoreError> {
        let mut out = Vec::new();
        for r in self.repo.references()? {
            let r = r?;
            if let (Some(name), Some(target)) = (r.name(), r.target()) {
                out.push(Reference { name: name.to_string(), id: RevisionId(target.to_string()) });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn publish_reference_listing(&mut self, listing: &[u8]) -> Result<(), StoreError> {
        let info = self.git_dir().join("info");
        std::fs::create_dir_all(&info).map_err(|e| io_err("mkdir", &info, e))?;
        let refs = info.join("refs");
        write_atomic(&refs, listing)?;

        let packs_dir = self.git_dir().join("objects").join("info");
        std::fs::create_dir_all(&packs_dir).map_err(|e| io_err("mkdir", &packs_dir, e))?;
        let packs = packs_dir.join("packs");
        let body = self.pack_listing()?;
        write_atomic(&packs, &body)?;
        Ok(())
    }

    fn history(&self) -> Result<Vec<RevisionRecord>, StoreError> {
        if self.head_commit()?.is_none() {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL)?;
        let mut out = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let message = commit.message().unwrap_or_default().to_string();
            let (path, action) = match parse_commit_message(&message) {
                Some((p, a)) => (p, Some(a)),
                None => (String::new(), None),
            };
            let blob = if path.is_empty() {
                None
            } else {
                commit
                    .tree()?
                    .get_path(Path::new(&path))
                    .ok()
                    .filter(|e| e.kind() == Some(ObjectType::Blob))
                    .map(|e| e.id().to_string())
            };
            let timestamp = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default();
            out.push(RevisionRecord {
                id: RevisionId(commit.id().to_string()),
                path,
                action,
                message,
                author: identity(&commit.author()),
                committer: identity(&commit.committer()),
                timestamp,
                blob,
            });
        }
        Ok(out)
    }
}

/// Content hash the backend assigns to `contents` stored as a file.
pub fn blob_hash(contents: &[u8]) -> Result<String, StoreError> {
    Ok(Oid::hash_object(ObjectType::Blob, contents)?.to_string())
}
