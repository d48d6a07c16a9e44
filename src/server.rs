use std::time::Duration;

use axum::extract::State;
use axum::routing::{any, post};
use axum::{Json, Router};
use log::{debug, error, warn};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::errors::Error;
use crate::master::{Event, SEND_TIMEOUT};
use crate::proto::{ExecRequest, ExecResponse};

/// Upper bound on a request handler waiting for the loop's reply; matches
/// the socket write deadline.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct ServerState {
    events: mpsc::Sender<Event>,
}

/// Serve the control API on the container's UNIX socket until the master
/// closes the termination signal. Request failures are answered in-band;
/// the listener itself stays up for the life of the container.
pub async fn serve(
    listener: UnixListener,
    events: mpsc::Sender<Event>,
    mut term: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/v1/hello", any(hello))
        .route("/v1/exec", post(exec))
        .with_state(ServerState { events });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = term.changed().await;
        })
        .await
}

/// Liveness: round-trip an event through the loop.
async fn hello(State(state): State<ServerState>) -> String {
    let (reply_tx, reply_rx) = oneshot::channel();
    let event = Event::Hello { reply: reply_tx };
    if state.events.send_timeout(event, SEND_TIMEOUT).await.is_err() {
        warn!("[server] hello event send timed out");
        return "event loop unavailable".to_string();
    }
    match timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(greeting)) => greeting,
        _ => "event loop unavailable".to_string(),
    }
}

async fn exec(
    State(state): State<ServerState>,
    Json(request): Json<ExecRequest>,
) -> Json<ExecResponse> {
    debug!("[server] exec request: {:?}", request);

    if request.path.is_empty() {
        return Json(ExecResponse::failed("empty exec path"));
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let event = Event::Exec {
        request,
        reply: reply_tx,
    };
    if state.events.send_timeout(event, SEND_TIMEOUT).await.is_err() {
        let err = Error::Timeout(SEND_TIMEOUT);
        error!("[server] exec event: {err}");
        return Json(ExecResponse::failed(&err.to_string()));
    }

    match timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(response)) => Json(response),
        Ok(Err(_)) => Json(ExecResponse::failed("event loop dropped the request")),
        Err(_) => Json(ExecResponse::failed(&Error::Timeout(REPLY_TIMEOUT).to_string())),
    }
}
