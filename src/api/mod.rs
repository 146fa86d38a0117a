// REST API endpoints for worker registration and code runs

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{Query, State},
    response::{
        Json, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::Url;

use crate::dispatcher::{AcquireMode, Dispatcher, WorkerStatus};
use crate::error::DispatchError;
use crate::events::{RunCodeRequest, RunEvent, seal};
use crate::registration::RegisterWorkerRequest;

pub type AppState = Arc<Dispatcher>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/worker", get(list_workers))
        .route("/api/worker/register", post(register_worker))
        .route("/api/worker/unregister", post(unregister_worker))
        .route("/api/worker/count", get(worker_count))
        .route("/api/run", post(run_code))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "workers": state.worker_count(),
    }))
}

async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<Json<Value>, DispatchError> {
    info!(
        "Registering worker at {} with max runs {}",
        request.worker_url, request.max_runs
    );
    state.register_worker(&request).await.inspect_err(|e| {
        error!(worker_url = %request.worker_url, error = %e, "Worker registration failed")
    })?;

    Ok(Json(serde_json::json!({
        "message": "Worker registered successfully."
    })))
}

#[derive(Debug, Deserialize)]
struct UnregisterWorkerRequest {
    #[serde(rename = "workerUrl")]
    worker_url: Url,
}

async fn unregister_worker(
    State(state): State<AppState>,
    Json(request): Json<UnregisterWorkerRequest>,
) -> Json<Value> {
    let removed = state.unregister_worker(&request.worker_url);
    Json(serde_json::json!({ "removed": removed }))
}

async fn worker_count(State(state): State<AppState>) -> Json<usize> {
    Json(state.worker_count())
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerStatus>> {
    Json(state.workers())
}

#[derive(Debug, Deserialize)]
struct RunQuery {
    /// Wait for a free worker instead of failing fast.
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

fn sse_frame(event: RunEvent) -> Result<Event, axum::Error> {
    Event::default().json_data(event)
}

/// Relay the worker's events as they arrive.
///
/// Failures before the worker accepts the run are plain HTTP errors; after
/// that the stream always finishes with an `end` event.
async fn run_code(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
    Json(request): Json<RunCodeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, DispatchError> {
    let started = Instant::now();
    let mode = if query.wait {
        AcquireMode::Wait
    } else {
        AcquireMode::FailFast
    };

    let events = state.submit(&request, mode).await?;
    let stream = seal(events, started).map(sse_frame);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSettings;
    use crate::test_support::FakeWorker;
    use std::time::Duration;

    struct TestApp {
        base: String,
        dispatcher: AppState,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    async fn spawn_app() -> TestApp {
        let dispatcher = Arc::new(
            Dispatcher::new(DispatchSettings {
                warmup_timeout_ms: 1_000,
                min_run_timeout: Duration::from_millis(300),
                ..Default::default()
            })
            .unwrap(),
        );
        let app = create_router(dispatcher.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestApp {
            base: format!("http://{}", addr),
            dispatcher,
            handle,
        }
    }

    fn data_frames(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_register_count_and_list() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/worker/register", app.base))
            .json(&serde_json::json!({"workerUrl": fake.url(), "maxRuns": 3}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "Worker registered successfully.");

        let count: usize = client
            .get(format!("{}/api/worker/count", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(count, 1);

        let workers: Value = client
            .get(format!("{}/api/worker", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(workers[0]["maxRuns"], 3);
        assert_eq!(workers[0]["currentRuns"], 0);
    }

    #[tokio::test]
    async fn test_register_rejects_negative_max_runs() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/worker/register", app.base))
            .json(&serde_json::json!({"workerUrl": fake.url(), "maxRuns": -1}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        assert!(response.text().await.unwrap().contains("MaxRuns"));
        assert_eq!(app.dispatcher.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_register_reports_probe_failure() {
        let fake = FakeWorker::start_rejecting_warm_up().await;
        let app = spawn_app().await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/worker/register", app.base))
            .json(&serde_json::json!({"workerUrl": fake.url(), "maxRuns": 0}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        assert!(response.text().await.unwrap().contains("warming failed"));
    }

    #[tokio::test]
    async fn test_run_relays_events_in_order() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;
        app.dispatcher
            .register_worker(&RegisterWorkerRequest::new(fake.url(), 0))
            .await
            .unwrap();

        let body = reqwest::Client::new()
            .post(format!("{}/api/run", app.base))
            .json(&serde_json::json!({"code": "print"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let kinds: Vec<String> = data_frames(&body)
            .iter()
            .map(|f| f["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, ["stdout", "stdout", "result", "end"]);
        assert_eq!(app.dispatcher.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_run_fail_fast_on_empty_pool() {
        let app = spawn_app().await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/run?wait=false", app.base))
            .json(&serde_json::json!({"code": "print"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn test_run_worker_failure_is_bad_gateway() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;
        app.dispatcher
            .register_worker(&RegisterWorkerRequest::new(fake.url(), 0))
            .await
            .unwrap();

        let response = reqwest::Client::new()
            .post(format!("{}/api/run", app.base))
            .json(&serde_json::json!({"code": "fail"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 502);
        assert!(response.text().await.unwrap().contains("worker exploded"));
        assert_eq!(app.dispatcher.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_run_truncated_stream_ends_with_error() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;
        app.dispatcher
            .register_worker(&RegisterWorkerRequest::new(fake.url(), 0))
            .await
            .unwrap();

        let body = reqwest::Client::new()
            .post(format!("{}/api/run", app.base))
            .json(&serde_json::json!({"code": "no-end"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let frames = data_frames(&body);
        let kinds: Vec<&str> = frames.iter().map(|f| f["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, ["stdout", "error", "end"]);
        assert!(frames[2]["error"].is_string());
    }

    #[tokio::test]
    async fn test_unregister_and_health() {
        let fake = FakeWorker::start().await;
        let app = spawn_app().await;
        let client = reqwest::Client::new();
        app.dispatcher
            .register_worker(&RegisterWorkerRequest::new(fake.url(), 0))
            .await
            .unwrap();

        let body: Value = client
            .post(format!("{}/api/worker/unregister", app.base))
            .json(&serde_json::json!({"workerUrl": fake.url()}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["removed"], true);

        let health: Value = client
            .get(format!("{}/health", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["workers"], 0);
    }
}
