use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use log::debug;
use tokio::net::UnixStream;

use crate::cli::{self, ExecArgs};
use crate::container::{Container, Mode};
use crate::errors::{Error, Result};
use crate::proto::{ExecRequest, ExecResponse};

/// Client side of the `exec` mode: load the persisted record, post the
/// request on the container's control socket, and relay the captured
/// output. The record stays transient; nothing is written back.
pub async fn exec(args: ExecArgs) -> Result<bool> {
    cli::validate_name(&args.name)?;
    let (path, argv) = cli::split_command(&args.exec)?;

    let mut container = Container::load(&args.name)?;
    container.mode = Mode::Exec;

    let request = ExecRequest { path, argv };
    let response = post_exec(&container.socket_file(), &request).await?;

    print!("{}", response.stdout);
    eprint!("{}", response.stderr);

    if response.is_success() {
        Ok(true)
    } else {
        eprintln!("exec in {} failed: {}", container.name, response.desc);
        Ok(false)
    }
}

/// POST /v1/exec over the UNIX socket and decode the reply.
pub async fn post_exec(socket: &Path, request: &ExecRequest) -> Result<ExecResponse> {
    let stream = UnixStream::connect(socket).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::Http(format!("handshake: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("[client] connection ended: {e}");
        }
    });

    let body = serde_json::to_vec(request)?;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/exec")
        .header("host", "minibox")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| Error::Http(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::Http(format!("send: {e}")))?;
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Http(format!("read body: {e}")))?
        .to_bytes();

    serde_json::from_slice(&bytes).map_err(|e| Error::RequestMalformed(e.to_string()))
}
