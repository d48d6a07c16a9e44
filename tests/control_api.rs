use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use minibox::client;
use minibox::master::Event;
use minibox::proto::{ExecRequest, ExecResponse};
use minibox::server;

/// Control server wired to a stand-in for the master loop: hello and exec
/// events are answered the way the real loop answers them, minus the
/// process spawning.
fn start_stack() -> (
    tempfile::TempDir,
    PathBuf,
    watch::Sender<bool>,
    JoinHandle<std::io::Result<()>>,
) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("unix.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let (event_tx, mut event_rx) = mpsc::channel(10);
    let (term_tx, term_rx) = watch::channel(false);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Hello { reply } => {
                    let _ = reply.send("hello, world".to_string());
                }
                Event::Exec { request, reply } => {
                    let response = if request.path == "/bin/false" {
                        ExecResponse::failed("exit status: 1")
                    } else {
                        ExecResponse::success(
                            format!("{}\n", request.argv.join(" ")),
                            String::new(),
                        )
                    };
                    let _ = reply.send(response);
                }
                _ => {}
            }
        }
    });

    let srv = tokio::spawn(server::serve(listener, event_tx, term_rx));
    (dir, socket, term_tx, srv)
}

async fn request(socket: &Path, method: &str, uri: &str, body: &str) -> (u16, String) {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "minibox")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status().as_u16();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get(socket: &Path, uri: &str) -> String {
    request(socket, "GET", uri, "").await.1
}

#[tokio::test]
async fn exec_round_trips_through_the_loop() {
    let (_dir, socket, _term, _srv) = start_stack();

    let request = ExecRequest {
        path: "/bin/echo".to_string(),
        argv: vec!["echo".to_string(), "x".to_string()],
    };
    let response = client::post_exec(&socket, &request).await.unwrap();

    assert!(response.is_success());
    assert_eq!(response.stdout, "echo x\n");
    assert_eq!(response.stderr, "");
}

#[tokio::test]
async fn exec_failure_is_reported_in_band() {
    let (_dir, socket, _term, _srv) = start_stack();

    let request = ExecRequest {
        path: "/bin/false".to_string(),
        argv: vec!["false".to_string()],
    };
    let response = client::post_exec(&socket, &request).await.unwrap();
    assert!(!response.is_success());
    assert_eq!(response.desc, "exit status: 1");

    // A failed request never takes the listener down.
    let request = ExecRequest {
        path: "/bin/echo".to_string(),
        argv: vec!["echo".to_string(), "again".to_string()],
    };
    let response = client::post_exec(&socket, &request).await.unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn hello_round_trips_an_event() {
    let (_dir, socket, _term, _srv) = start_stack();
    assert_eq!(get(&socket, "/v1/hello").await, "hello, world");
}

#[tokio::test]
async fn hello_accepts_any_method() {
    let (_dir, socket, _term, _srv) = start_stack();
    let (status, body) = request(&socket, "POST", "/v1/hello", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello, world");
}

#[tokio::test]
async fn malformed_exec_body_is_rejected_in_band() {
    let (_dir, socket, _term, _srv) = start_stack();

    let (status, _body) = request(&socket, "POST", "/v1/exec", "{not json").await;
    assert_eq!(status, 400);

    // The listener survives malformed input.
    let (status, body) = request(&socket, "GET", "/v1/hello", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello, world");
}

#[tokio::test]
async fn server_returns_once_terminated() {
    let (_dir, socket, term, srv) = start_stack();

    // Still serving before the termination signal.
    assert_eq!(get(&socket, "/v1/hello").await, "hello, world");

    term.send(true).unwrap();
    timeout(Duration::from_secs(5), srv)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}
