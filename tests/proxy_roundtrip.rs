//! End-to-end proxy tests over a real listener, backed by an
//! in-memory blob store.

use std::sync::Arc;

use clap::Parser;
use rand::RngCore;
use tempfile::TempDir;
use tokio::net::TcpListener;

use camgate::auth::{basic_header, AuthCheck};
use camgate::config::Args;
use camgate::download::{Downloader, DownloaderConfig};
use camgate::server::{self, AppState};
use camgate::store::{BlobStore, MemoryStore};
use camgate::upload::{Uploader, UploaderConfig};

const SERVER_TAG: &str = "mem://itest";

async fn spawn_proxy(auth: Option<AuthCheck>) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut args = Args::parse_from(["camgate"]);
    args.server = SERVER_TAG.to_string();
    args.mime_cache_path = Some(dir.path().join("mime.kv"));

    let state = AppState::new(args, auth);
    let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
    let up = Uploader::with_store(
        Arc::clone(&store),
        UploaderConfig::new(SERVER_TAG),
        true,
    );
    let down = Downloader::with_fetcher(SERVER_TAG, store, DownloaderConfig::new(SERVER_TAG));
    state.registry.install(SERVER_TAG, up, down);

    let state = Arc::new(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve_listener(state, listener).await;
    });
    (format!("http://{addr}"), dir)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn upload_then_download_roundtrip() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();
    let data = random_bytes(1024);

    // multipart upload
    let part = reqwest::multipart::Part::bytes(data.clone()).file_name("u.bin");
    let form = reqwest::multipart::Form::new().part("upfile", part);
    let resp = client
        .post(format!("{base}/"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let body = resp.text().await.unwrap();
    let content_ref = body.lines().next().unwrap().to_string();
    assert!(content_ref.contains('-'), "not a ref: {content_ref}");

    // raw=1 returns the schema JSON
    let resp = client
        .get(format!("{base}/{content_ref}?raw=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/json"
    );
    let schema: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(schema["camliType"], "file");
    assert_eq!(schema["fileName"], "u.bin");
    let parts_total: u64 = schema["parts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["size"].as_u64().unwrap())
        .sum();
    assert_eq!(parts_total, 1024);

    // plain GET returns the original bytes
    let resp = client.get(format!("{base}/{content_ref}")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), data);
}

#[tokio::test]
async fn direct_post_with_disposition_filename() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/"))
        .header("Content-Disposition", "attachment; filename=\"direct.txt\"")
        .header("Content-Type", "text/plain")
        .body("a direct body upload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let content_ref = resp.text().await.unwrap().lines().next().unwrap().to_string();

    let resp = client.get(format!("{base}/{content_ref}?raw=1")).send().await.unwrap();
    let schema: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(schema["fileName"], "direct.txt");
    assert_eq!(schema["mimeType"], "text/plain");

    let resp = client.get(format!("{base}/{content_ref}")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "a direct body upload");
}

#[tokio::test]
async fn short_refs_roundtrip() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();

    let part = reqwest::multipart::Part::bytes(b"short form please".to_vec()).file_name("s.txt");
    let form = reqwest::multipart::Form::new().part("upfile", part);
    let resp = client
        .post(format!("{base}/?short=1"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let short_ref = resp.text().await.unwrap().lines().next().unwrap().to_string();

    // the short form is a valid GET path too
    let resp = client.get(format!("{base}/{short_ref}")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "short form please");
}

#[tokio::test]
async fn malformed_and_missing_refs() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/notaref")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .get(format!(
            "{base}/sha1-0000000000000000000000000000000000000000"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client.delete(format!("{base}/")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 405);
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();

    let part = reqwest::multipart::Part::bytes(Vec::new()).file_name("empty.bin");
    let form = reqwest::multipart::Form::new().part("upfile", part);
    let resp = client
        .post(format!("{base}/"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn basic_auth_gates_requests() {
    let auth = AuthCheck::from_spec("userpass:alice:secret").unwrap();
    let (base, _dir) = spawn_proxy(Some(auth)).await;
    let client = reqwest::Client::new();

    // no credentials
    let resp = client.get(format!("{base}/x")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    assert!(resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("camproxy"));

    // wrong password
    let resp = client
        .get(format!("{base}/x"))
        .header("Authorization", basic_header("alice", "wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // correct credentials: the full upload/download cycle works
    let part = reqwest::multipart::Part::bytes(b"guarded".to_vec()).file_name("g.txt");
    let form = reqwest::multipart::Form::new().part("upfile", part);
    let resp = client
        .post(format!("{base}/"))
        .header("Authorization", basic_header("alice", "secret"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let content_ref = resp.text().await.unwrap().lines().next().unwrap().to_string();

    let resp = client
        .get(format!("{base}/{content_ref}"))
        .header("Authorization", basic_header("alice", "secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "guarded");
}

#[tokio::test]
async fn mtime_query_is_applied_to_file_blob() {
    let (base, _dir) = spawn_proxy(None).await;
    let client = reqwest::Client::new();

    let part = reqwest::multipart::Part::bytes(b"timed upload".to_vec()).file_name("t.txt");
    let form = reqwest::multipart::Form::new().part("upfile", part);
    let resp = client
        .post(format!("{base}/?mtime=1600000000"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let content_ref = resp.text().await.unwrap().lines().next().unwrap().to_string();

    let resp = client.get(format!("{base}/{content_ref}?raw=1")).send().await.unwrap();
    let schema: serde_json::Value = resp.json().await.unwrap();
    let mtime = schema["unixMtime"].as_str().unwrap();
    assert!(mtime.starts_with("2020-09-13"), "unexpected mtime {mtime}");
}
