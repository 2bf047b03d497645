#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use cfghist_core::{ChangeEvent, Gvk, ObjectId};
use cfghist_gitserver::{bind, serve, ServerConfig, ServerState};
use cfghist_store::{GitBackend, HistoryConfig, HistoryStore};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), cfghist_gitserver::GitServerError>>,
}

async fn start(state: ServerState) -> Running {
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let cfg = ServerConfig { grace: Duration::from_secs(5), ..ServerConfig::default() };
    let task = tokio::spawn(serve(listener, state, cfg, shutdown.clone()));
    Running { addr, shutdown, task }
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}/cluster-config{path}")
}

fn widget() -> Gvk {
    Gvk::new("example.io", "v1", "Widget")
}

#[tokio::test]
async fn serves_git_metadata_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = HistoryStore::new(GitBackend::open_or_init(dir.path()).unwrap(), HistoryConfig::default());
    store.record(&ChangeEvent::added(widget(), ObjectId::cluster("w1"), json!({"name": "w1"}))).unwrap();
    let git_dir = store.backend().git_dir().to_path_buf();

    let server = start(ServerState::new(&git_dir)).await;
    let client = reqwest::Client::new();
    for path in ["/HEAD", "/info/refs", "/objects/info/packs"] {
        let res = client.get(url(server.addr, path)).send().await.unwrap();
        assert_eq!(res.status(), 200, "{path}");
        let body = res.bytes().await.unwrap();
        let on_disk = std::fs::read(git_dir.join(path.trim_start_matches('/'))).unwrap();
        assert_eq!(body.as_ref(), on_disk.as_slice(), "{path}");
    }

    let refs = std::fs::read_to_string(git_dir.join("info/refs")).unwrap();
    let head = &store.history().unwrap()[0].id;
    assert!(refs.starts_with(&format!("{head}\trefs/heads/")), "{refs}");

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn request_ids_and_health_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let state = ServerState::new(dir.path());
    let server = start(state.clone()).await;
    let client = reqwest::Client::new();

    let res = client.get(url(server.addr, "/healthz")).header("x-request-id", "req-42").send().await.unwrap();
    assert_eq!(res.status(), 204);
    assert_eq!(res.headers()["x-request-id"], "req-42");

    let res = client.get(url(server.addr, "/no-such-file")).send().await.unwrap();
    assert_eq!(res.status(), 404);
    assert!(res.headers().contains_key("x-request-id"));

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
    assert!(!state.health().is_healthy());
    assert!(reqwest::get(url(server.addr, "/healthz")).await.is_err());
}

#[tokio::test]
async fn added_then_deleted_is_visible_to_readers() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = HistoryStore::new(GitBackend::open_or_init(dir.path()).unwrap(), HistoryConfig::default());
    let server = start(ServerState::new(store.backend().git_dir())).await;

    store.record(&ChangeEvent::added(widget(), ObjectId::cluster("w1"), json!({"name": "w1"}))).unwrap();
    store.record(&ChangeEvent::deleted(widget(), ObjectId::cluster("w1"))).unwrap();

    let log = store.history().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].message, "\"widget.v1.example.io.yaml\" removes");
    assert!(!dir.path().join("widget.v1.example.io.yaml").exists());

    let client = reqwest::Client::new();
    let refs = client.get(url(server.addr, "/info/refs")).send().await.unwrap().text().await.unwrap();
    assert!(refs.starts_with(&log[0].id.to_string()), "{refs}");
    let res = client.get(url(server.addr, "/healthz")).send().await.unwrap();
    assert_eq!(res.status(), 204);

    server.shutdown.cancel();
    server.task.await.unwrap().unwrap();
}
