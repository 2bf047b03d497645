#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use cfghist_core::{ChangeEvent, Gvk, ObjectId};
use cfghist_store::{blob_hash, encode, spawn_writer, GitBackend, HistoryConfig, HistoryStore};
use serde_json::json;

fn kind(n: usize) -> Gvk {
    Gvk::new("example.io", "v1", format!("Kind{n}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_watches_produce_one_commit_per_event() {
    const WATCHES: usize = 4;
    const PER_WATCH: usize = 10;

    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(GitBackend::open_or_init(dir.path()).unwrap(), HistoryConfig::default());
    let (tx, writer) = spawn_writer(store, 8);
    let processed = writer.processed();

    // Valid content hashes per path; anything else would be a torn write.
    let mut valid: HashMap<String, HashSet<String>> = HashMap::new();
    let mut tasks = Vec::new();
    for w in 0..WATCHES {
        let gvk = kind(w);
        let path = gvk.file_name("yaml");
        for i in 0..PER_WATCH {
            let body = json!({"watch": w, "seq": i, "padding": "x".repeat(512 * (i + 1))});
            valid.entry(path.clone()).or_default().insert(blob_hash(&encode(&path, &body).unwrap()).unwrap());
        }
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_WATCH {
                let body = json!({"watch": w, "seq": i, "padding": "x".repeat(512 * (i + 1))});
                let ev = if i == 0 {
                    ChangeEvent::added(gvk.clone(), ObjectId::cluster("cluster"), body)
                } else {
                    ChangeEvent::updated(gvk.clone(), ObjectId::cluster("cluster"), body)
                };
                tx.send(ev).await.unwrap();
            }
        }));
    }
    drop(tx);
    for t in tasks {
        t.await.unwrap();
    }

    let store = writer.join(Duration::from_secs(30)).await.unwrap();
    assert_eq!(*processed.borrow(), (WATCHES * PER_WATCH) as u64);

    let log = store.history().unwrap();
    assert_eq!(log.len(), WATCHES * PER_WATCH);
    for rec in &log {
        let hashes = valid.get(&rec.path).expect("known path");
        let blob = rec.blob.as_ref().expect("no tombstones in this run");
        assert!(hashes.contains(blob), "commit {} holds unexpected content for {}", rec.id, rec.path);
    }

    // Per-watch order survives the fan-in: seq numbers per path increase.
    let mut last_seq: HashMap<String, i64> = HashMap::new();
    for rec in log.iter().rev() {
        let seq = seq_of(&store, rec);
        let prev = last_seq.insert(rec.path.clone(), seq).unwrap_or(-1);
        assert!(seq > prev, "{}: seq {} after {}", rec.path, seq, prev);
    }
}

fn seq_of(store: &HistoryStore<GitBackend>, rec: &cfghist_store::RevisionRecord) -> i64 {
    let repo = git2::Repository::open(store.backend().workdir()).unwrap();
    let oid = git2::Oid::from_str(rec.blob.as_ref().unwrap()).unwrap();
    let blob = repo.find_blob(oid).unwrap();
    let v: serde_json::Value = serde_yaml::from_slice(blob.content()).unwrap();
    v["seq"].as_i64().unwrap()
}

#[tokio::test]
async fn writer_drains_queue_before_join_returns() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(GitBackend::open_or_init(dir.path()).unwrap(), HistoryConfig::default());
    let (tx, writer) = spawn_writer(store, 64);
    for i in 0..20 {
        tx.send(ChangeEvent::updated(kind(0), ObjectId::cluster("c"), json!({"seq": i}))).await.unwrap();
    }
    drop(tx);
    let store = writer.join(Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.history().unwrap().len(), 20);
    let current: serde_json::Value = serde_yaml::from_slice(&store.current(&kind(0)).unwrap().unwrap()).unwrap();
    assert_eq!(current, json!({"seq": 19}));
}
