//! In-process stand-in for a remote executor worker.
//!
//! Serves `POST /run` on an ephemeral local port and answers based on the
//! submitted code:
//!
//! - `fail`: 500 with body `worker exploded`
//! - `garbage`: one stdout event followed by a payload that is not JSON
//! - `no-end`: one stdout event, then the stream closes
//! - `hang`: one stdout event, then nothing until the client gives up
//! - anything else: two stdout lines, `result` 42, and an `end` summary
//!
//! Warm-up requests are answered with a plain end event, unless the worker
//! was started with [`FakeWorker::start_rejecting_warm_up`].

#![cfg(test)]

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::post,
};
use futures::stream::{self, StreamExt};
use serde_json::json;
use url::Url;

use crate::events::RunCodeRequest;

#[derive(Default)]
struct FakeState {
    reject_warm_up: bool,
    runs: AtomicUsize,
    warm_ups: AtomicUsize,
}

pub struct FakeWorker {
    url: Url,
    state: Arc<FakeState>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeWorker {
    pub async fn start() -> Self {
        Self::spawn(FakeState::default()).await
    }

    pub async fn start_rejecting_warm_up() -> Self {
        Self::spawn(FakeState {
            reject_warm_up: true,
            ..Default::default()
        })
        .await
    }

    async fn spawn(state: FakeState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/run", post(run))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: Url::parse(&format!("http://{}", addr)).unwrap(),
            state,
            handle,
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    /// Non-warm-up requests received so far.
    pub fn runs(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn warm_ups(&self) -> usize {
        self.state.warm_ups.load(Ordering::SeqCst)
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn frame(value: serde_json::Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(value.to_string()))
}

async fn run(State(state): State<Arc<FakeState>>, Json(request): Json<RunCodeRequest>) -> Response {
    if request.is_warm_up {
        state.warm_ups.fetch_add(1, Ordering::SeqCst);
        if state.reject_warm_up {
            return (StatusCode::SERVICE_UNAVAILABLE, "warming failed").into_response();
        }
        let end = json!({"kind": "end", "stdOutput": "Hello World!\n", "elapsed": 1});
        return Sse::new(stream::iter([frame(end)])).into_response();
    }

    state.runs.fetch_add(1, Ordering::SeqCst);
    let first = json!({"kind": "stdout", "stdOutput": "line 1\n"});

    match request.code.as_str() {
        "fail" => (StatusCode::INTERNAL_SERVER_ERROR, "worker exploded").into_response(),
        "garbage" => Sse::new(stream::iter([
            frame(first),
            Ok(Event::default().data("{not json")),
        ]))
        .into_response(),
        "no-end" => Sse::new(stream::iter([frame(first)])).into_response(),
        "hang" => Sse::new(stream::iter([frame(first)]).chain(stream::pending())).into_response(),
        _ => Sse::new(stream::iter([
            frame(first),
            frame(json!({"kind": "stdout", "stdOutput": "line 2\n"})),
            frame(json!({"kind": "result", "result": 42})),
            frame(json!({
                "kind": "end",
                "stdOutput": "line 1\nline 2\n",
                "result": 42,
                "elapsed": 5,
            })),
        ]))
        .into_response(),
    }
}
