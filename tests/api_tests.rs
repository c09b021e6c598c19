//! Integration tests for the HTTP API.

mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use common::{TestEnv, payload};
use dropit::{
    handlers::identity::USER_ID_HEADER, models::file::Owner, routes::routes,
    services::file_service::FileService,
};
use futures::stream;
use serde_json::Value;
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tower::ServiceExt;

const BOUNDARY: &str = "dropit-test-boundary";

fn router(env: &TestEnv) -> Router {
    routes::routes(1024 * 1024).with_state(env.service())
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

async fn upload(router: &Router, user: Option<i64>, filename: &str, data: &[u8]) -> Value {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/files")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(id) = user {
        builder = builder.header(USER_ID_HEADER, id.to_string());
    }
    let request = builder
        .body(Body::from(multipart_body("file", filename, data)))
        .unwrap();

    let (status, headers, body) = send(router, request).await;
    assert_eq!(status, StatusCode::CREATED);
    let file = json(&body)["file"].clone();
    let token = file["token"].as_str().unwrap();
    assert_eq!(
        headers[header::LOCATION].to_str().unwrap(),
        format!("/files/{token}")
    );
    file
}

/// Audits run on a spawned task; wait until `token` reaches `expected`.
async fn wait_for_downloads(service: &FileService, token: &str, expected: i64) -> i64 {
    let mut count = 0;
    for _ in 0..100 {
        count = service.get(token).await.unwrap().download_count;
        if count >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    count
}

/// Serve the router on an ephemeral port.
async fn serve(env: &TestEnv) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(env);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Plain HTTP/1.1 GET over a fresh connection; returns the head and body.
async fn http_get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .as_bytes(),
    )
    .await
    .unwrap();

    let mut raw = Vec::new();
    conn.read_to_end(&mut raw).await.unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    (head, raw[split + 4..].to_vec())
}

async fn store_file(env: &TestEnv, filename: &str, data: Vec<u8>) -> String {
    env.service()
        .upload(
            Owner::Anonymous,
            filename,
            stream::once(async move { Ok::<_, io::Error>(Bytes::from(data)) }),
        )
        .await
        .unwrap()
        .token
}

fn request(method: &str, uri: &str, user: Option<i64>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(id) = user {
        builder = builder.header(USER_ID_HEADER, id.to_string());
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn upload_then_download_records_the_access() {
    let env = TestEnv::new().await;
    let router = router(&env);
    let data = payload(1000);

    let file = upload(&router, None, "hello.bin", &data).await;
    assert!(file["owner_id"].is_null());
    assert_eq!(file["download_count"], 0);
    assert!(file.get("storage_path").is_none());
    let token = file["token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 8);

    let (status, headers, body) = send(&router, request("GET", &format!("/files/{token}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
    assert_eq!(headers[header::CONTENT_LENGTH], "1000");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"hello.bin\""
    );

    assert_eq!(wait_for_downloads(&env.service(), &token, 1).await, 1);
}

#[tokio::test]
async fn downloads_over_a_real_connection_are_recorded() {
    let env = TestEnv::new().await;
    let data = payload(1000);
    let token = store_file(&env, "data.bin", data.clone()).await;
    let addr = serve(&env).await;

    for expected in 1..=2 {
        let (head, body) = http_get(addr, &format!("/files/{token}")).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert_eq!(body, data);
        assert_eq!(
            wait_for_downloads(&env.service(), &token, expected).await,
            expected
        );
    }
}

#[tokio::test]
async fn abandoned_download_is_not_recorded() {
    let env = TestEnv::new().await;
    // Far larger than the socket buffers, so the server is still writing
    // when the client goes away.
    let token = store_file(&env, "big.bin", vec![7u8; 32 * 1024 * 1024]).await;
    let addr = serve(&env).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        format!("GET /files/{token} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();
    let mut first = vec![0u8; 64 * 1024];
    conn.read_exact(&mut first).await.unwrap();
    assert!(first.starts_with(b"HTTP/1.1 200"));
    drop(conn);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.service().get(&token).await.unwrap().download_count, 0);
}

#[tokio::test]
async fn ranges_and_conditional_requests() {
    let env = TestEnv::new().await;
    let router = router(&env);
    let data = payload(1000);
    let token = store_file(&env, "data.bin", data.clone()).await;
    let uri = format!("/files/{token}");

    let partial = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=0-99")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&router, partial).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-99/1000");
    assert_eq!(headers[header::CONTENT_LENGTH], "100");
    assert_eq!(body, &data[..100]);

    let tail = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=900-")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&router, tail).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 900-999/1000");
    assert_eq!(body, &data[900..]);

    // Only the range that finishes the file counts as a download.
    assert_eq!(wait_for_downloads(&env.service(), &token, 1).await, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.service().get(&token).await.unwrap().download_count, 1);

    let beyond = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=5000-")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&router, beyond).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes */1000");

    let last_modified = headers_of(&router, &uri).await[header::LAST_MODIFIED].clone();
    let conditional = Request::builder()
        .uri(&uri)
        .header(header::IF_MODIFIED_SINCE, last_modified)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, conditional).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
}

async fn headers_of(router: &Router, uri: &str) -> header::HeaderMap {
    let (status, headers, _) = send(router, request("GET", uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    headers
}

#[tokio::test]
async fn non_ascii_filenames_are_encoded() {
    let env = TestEnv::new().await;
    let router = router(&env);
    let token = store_file(&env, "naïve.txt", b"text".to_vec()).await;
    let uri = format!("/files/{token}");

    let headers = headers_of(&router, &uri).await;
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"na_ve.txt\"; filename*=UTF-8''na%C3%AFve.txt"
    );
}

#[tokio::test]
async fn unknown_token_is_404() {
    let env = TestEnv::new().await;
    let router = router(&env);

    let (status, _, body) = send(&router, request("GET", "/files/zzzzzzzz", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["status"], 404);
}

#[tokio::test]
async fn upload_without_file_field_is_400() {
    let env = TestEnv::new().await;
    let router = router(&env);

    let request = Request::builder()
        .method("POST")
        .uri("/files")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body("attachment", "x.txt", b"x")))
        .unwrap();
    let (status, _, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(env.blob_count().await, 0);
}

#[tokio::test]
async fn delete_requires_the_owner() {
    let env = TestEnv::new().await;
    let router = router(&env);
    let file = upload(&router, Some(5), "owned.txt", b"private").await;
    let uri = format!("/files/{}", file["token"].as_str().unwrap());

    let (status, _, _) = send(&router, request("DELETE", &uri, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = send(&router, request("DELETE", &uri, Some(6))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send(&router, request("DELETE", &uri, Some(5))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["message"], "file successfully deleted");

    let (status, _, _) = send(&router, request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_identity_is_400() {
    let env = TestEnv::new().await;
    let router = router(&env);

    for value in ["abc", "0", "-2"] {
        let request = Request::builder()
            .method("DELETE")
            .uri("/files/zzzzzzzz")
            .header(USER_ID_HEADER, value)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{value}");
    }
}

#[tokio::test]
async fn lists_a_users_files() {
    let env = TestEnv::new().await;
    let router = router(&env);
    upload(&router, Some(2), "a.txt", b"a").await;
    upload(&router, Some(2), "b.txt", b"b").await;
    upload(&router, Some(3), "c.txt", b"c").await;

    let (status, _, body) = send(&router, request("GET", "/users/2/files", None)).await;
    assert_eq!(status, StatusCode::OK);
    let files = json(&body)["files"].as_array().unwrap().clone();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f["owner_id"] == 2));

    let (status, _, _) = send(&router, request("GET", "/users/0/files", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_checks_report_ok() {
    let env = TestEnv::new().await;
    let router = router(&env);

    let (status, _, _) = send(&router, request("GET", "/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&router, request("GET", "/readyz", None)).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["checks"]["metadata"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}

#[tokio::test]
async fn readiness_fails_when_storage_is_unwritable() {
    let env = TestEnv::new().await;
    let router = router(&env);
    tokio::fs::remove_dir_all(env.blobs.root().join(".staging"))
        .await
        .unwrap();

    let (status, _, body) = send(&router, request("GET", "/readyz", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body = json(&body);
    assert_eq!(body["status"], "error");
    assert_eq!(body["checks"]["metadata"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], false);
    assert!(body["checks"]["disk"]["error"].is_string());
}
