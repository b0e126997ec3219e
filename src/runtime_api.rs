//! Runtime HTTP/SSE API for threads, runs and crons.

use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::cron::SharedCronScheduler;
use crate::error_taxonomy::{ErrorCategory, ErrorEnvelope, RuntimeError};
use crate::models::{
    CancelQuery, Cron, CronCreate, CronSearch, CronUpdate, HistoryQuery, OnDisconnect, Run,
    RunCreate, RunListQuery, RunStatus, Thread, ThreadCreate, ThreadSearch, ThreadState,
    ThreadStateUpdate,
};
use crate::runs::{Completion, RunStream, SharedRunManager};
use crate::stream::{DisconnectGuard, frame_stream, sse_response};
use crate::threads::SharedThreadManager;

const OWNER_HEADER: &str = "x-owner-id";
const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct RuntimeApiState {
    pub threads: SharedThreadManager,
    pub runs: SharedRunManager,
    pub crons: SharedCronScheduler,
}

/// Serve the API until `shutdown` fires, then drain open connections.
pub async fn run_http_server(
    addr: &str,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid bind address '{addr}'"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!("Runtime API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow!("Runtime API server error: {e}"))
}

pub fn build_router(state: RuntimeApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ok", get(ok))
        .route("/threads", post(create_thread))
        .route("/threads/search", post(search_threads))
        .route("/threads/count", post(count_threads))
        .route("/threads/{thread_id}", get(get_thread).delete(delete_thread))
        .route(
            "/threads/{thread_id}/state",
            get(get_thread_state).post(update_thread_state),
        )
        .route(
            "/threads/{thread_id}/history",
            get(get_thread_history).post(post_thread_history),
        )
        .route(
            "/threads/{thread_id}/runs",
            get(list_runs).post(create_thread_run),
        )
        .route("/threads/{thread_id}/runs/wait", post(wait_thread_run))
        .route("/threads/{thread_id}/runs/stream", post(stream_thread_run))
        .route("/threads/{thread_id}/runs/crons", post(create_thread_cron))
        .route(
            "/threads/{thread_id}/runs/{run_id}",
            get(get_run).delete(delete_run),
        )
        .route("/threads/{thread_id}/runs/{run_id}/join", get(join_run))
        .route(
            "/threads/{thread_id}/runs/{run_id}/stream",
            get(reconnect_thread_run),
        )
        .route(
            "/threads/{thread_id}/runs/{run_id}/cancel",
            post(cancel_thread_run),
        )
        .route("/runs", post(create_stateless_run))
        .route("/runs/wait", post(wait_stateless_run))
        .route("/runs/stream", post(stream_stateless_run))
        .route("/runs/crons", post(create_stateless_cron))
        .route("/runs/crons/search", post(search_crons))
        .route("/runs/crons/count", post(count_crons))
        .route(
            "/runs/crons/{cron_id}",
            get(get_cron).patch(update_cron).delete(delete_cron),
        )
        .route("/runs/{run_id}/stream", get(reconnect_stateless_run))
        .route("/runs/{run_id}/cancel", post(cancel_stateless_run))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// `None` when the request is anonymous (unscoped).
fn owner(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != ANONYMOUS)
}

async fn ok() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// === Threads ===

async fn create_thread(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ThreadCreate>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.threads.create(owner(&headers), req).await?))
}

async fn search_threads(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(search): ApiJson<ThreadSearch>,
) -> Result<Json<Vec<Thread>>, ApiError> {
    Ok(Json(state.threads.search(owner(&headers), search).await?))
}

async fn count_threads(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(search): ApiJson<ThreadSearch>,
) -> Result<Json<usize>, ApiError> {
    Ok(Json(state.threads.count(owner(&headers), search).await?))
}

async fn get_thread(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.threads.get(owner(&headers), &thread_id).await?))
}

async fn delete_thread(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.threads.delete(owner(&headers), &thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_thread_state(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadState>, ApiError> {
    Ok(Json(state.threads.state(owner(&headers), &thread_id).await?))
}

async fn update_thread_state(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(update): ApiJson<ThreadStateUpdate>,
) -> Result<Json<ThreadState>, ApiError> {
    let snapshot = state
        .threads
        .update_state(owner(&headers), &thread_id, update.values)
        .await?;
    Ok(Json(snapshot))
}

async fn get_thread_history(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> Result<Json<Vec<ThreadState>>, ApiError> {
    Ok(Json(
        state
            .threads
            .history(owner(&headers), &thread_id, query)
            .await?,
    ))
}

async fn post_thread_history(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(query): ApiJson<HistoryQuery>,
) -> Result<Json<Vec<ThreadState>>, ApiError> {
    Ok(Json(
        state
            .threads
            .history(owner(&headers), &thread_id, query)
            .await?,
    ))
}

// === Runs ===

async fn list_runs(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiQuery(query): ApiQuery<RunListQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(
        state.runs.list(owner(&headers), &thread_id, query).await?,
    ))
}

async fn create_thread_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .runs
        .create(owner(&headers), Some(&thread_id), req)
        .await?;
    Ok(Json(run))
}

async fn create_stateless_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.runs.create(owner(&headers), None, req).await?))
}

async fn wait_thread_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Json<Value>, ApiError> {
    let completion = state
        .runs
        .create_and_wait(owner(&headers), Some(&thread_id), req)
        .await?;
    settled(completion)
}

async fn wait_stateless_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Json<Value>, ApiError> {
    let completion = state
        .runs
        .create_and_wait(owner(&headers), None, req)
        .await?;
    settled(completion)
}

/// Final values of a settled run, or its error envelope.
fn settled(completion: Completion) -> Result<Json<Value>, ApiError> {
    let Some(envelope) = completion.run.error else {
        return Ok(Json(completion.values));
    };
    let status = match completion.run.status {
        RunStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RunStatus::Interrupted => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Err(ApiError {
        status,
        envelope,
        retryable: false,
    })
}

async fn stream_thread_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Response, ApiError> {
    let owner = owner(&headers);
    let stream = state
        .runs
        .create_and_stream(owner, Some(&thread_id), req)
        .await?;
    Ok(stream_response(&state, owner, stream, true))
}

async fn stream_stateless_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RunCreate>,
) -> Result<Response, ApiError> {
    let owner = owner(&headers);
    let stream = state.runs.create_and_stream(owner, None, req).await?;
    Ok(stream_response(&state, owner, stream, true))
}

async fn reconnect_thread_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let owner = owner(&headers);
    let stream = state
        .runs
        .reconnect(owner, Some(&thread_id), &run_id)
        .await?;
    Ok(stream_response(&state, owner, stream, false))
}

async fn reconnect_stateless_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = owner(&headers);
    let stream = state.runs.reconnect(owner, None, &run_id).await?;
    Ok(stream_response(&state, owner, stream, false))
}

fn stream_response(
    state: &RuntimeApiState,
    owner: Option<&str>,
    stream: RunStream,
    created: bool,
) -> Response {
    let run = stream.run;
    let on_disconnect = (created && run.kwargs.on_disconnect == OnDisconnect::Cancel)
        .then(|| cancel_on_disconnect(state.runs.clone(), owner, &run));
    let body = frame_stream(
        stream.subscription,
        run.kwargs.stream_mode.clone(),
        DisconnectGuard::new(on_disconnect),
    );
    sse_response(&run.stream_location(), body)
}

fn cancel_on_disconnect(
    runs: SharedRunManager,
    owner: Option<&str>,
    run: &Run,
) -> Box<dyn FnOnce() + Send> {
    let owner = owner.map(str::to_string);
    let thread_id = run.thread_id.clone();
    let run_id = run.run_id.clone();
    Box::new(move || {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            tracing::info!(run_id = %run_id, "stream client disconnected; cancelling run");
            if let Err(err) = runs
                .cancel(
                    owner.as_deref(),
                    thread_id.as_deref(),
                    &run_id,
                    CancelQuery::default(),
                )
                .await
            {
                tracing::warn!("Failed to cancel run {run_id} after disconnect: {err}");
            }
        });
    })
}

async fn get_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(
        state
            .runs
            .get(owner(&headers), Some(&thread_id), &run_id)
            .await?,
    ))
}

async fn delete_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .runs
        .delete(owner(&headers), Some(&thread_id), &run_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(
        state
            .runs
            .join(owner(&headers), &thread_id, &run_id)
            .await?,
    ))
}

async fn cancel_thread_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path((thread_id, run_id)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<CancelQuery>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .runs
        .cancel(owner(&headers), Some(&thread_id), &run_id, query)
        .await?;
    Ok(Json(run))
}

async fn cancel_stateless_run(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    ApiQuery(query): ApiQuery<CancelQuery>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .runs
        .cancel(owner(&headers), None, &run_id, query)
        .await?;
    Ok(Json(run))
}

// === Crons ===

async fn create_thread_cron(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    ApiJson(req): ApiJson<CronCreate>,
) -> Result<Json<Cron>, ApiError> {
    let cron = state
        .crons
        .create(owner(&headers), Some(&thread_id), req)
        .await?;
    Ok(Json(cron))
}

async fn create_stateless_cron(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<CronCreate>,
) -> Result<Json<Cron>, ApiError> {
    Ok(Json(state.crons.create(owner(&headers), None, req).await?))
}

async fn search_crons(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(search): ApiJson<CronSearch>,
) -> Result<Json<Vec<Cron>>, ApiError> {
    Ok(Json(state.crons.search(owner(&headers), search).await?))
}

async fn count_crons(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    ApiJson(search): ApiJson<CronSearch>,
) -> Result<Json<usize>, ApiError> {
    Ok(Json(state.crons.count(owner(&headers), search).await?))
}

async fn get_cron(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(cron_id): Path<String>,
) -> Result<Json<Cron>, ApiError> {
    Ok(Json(state.crons.get(owner(&headers), &cron_id).await?))
}

async fn update_cron(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(cron_id): Path<String>,
    ApiJson(patch): ApiJson<CronUpdate>,
) -> Result<Json<Cron>, ApiError> {
    Ok(Json(
        state.crons.update(owner(&headers), &cron_id, patch).await?,
    ))
}

async fn delete_cron(
    State(state): State<RuntimeApiState>,
    headers: HeaderMap,
    Path(cron_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.crons.delete(owner(&headers), &cron_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Plumbing ===

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else if origins.is_empty() {
        AllowOrigin::list([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
    } else {
        AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| tracing::warn!("Ignoring invalid CORS origin '{origin}'"))
                .ok()
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

/// JSON body whose rejections are reported in the error envelope.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string whose rejections are reported in the error envelope.
struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
    retryable: bool,
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match err.category() {
            ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCategory::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Executor
            | ErrorCategory::Storage
            | ErrorCategory::Scheduler
            | ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {err}");
        }
        Self {
            status,
            envelope: err.envelope(),
            retryable: err.is_retryable(),
        }
    }
}

impl ApiError {
    fn rejected(status: StatusCode, message: String) -> Self {
        Self {
            status,
            envelope: RuntimeError::validation(message).envelope(),
            retryable: false,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.envelope)).into_response();
        if self.retryable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ThreadLocks;
    use crate::config::{RunsConfig, SchedulerConfig};
    use crate::cron::CronScheduler;
    use crate::executor::EchoExecutor;
    use crate::runs::RunManager;
    use crate::storage::{MemoryStorage, SharedStorage};
    use crate::threads::ThreadManager;
    use anyhow::{Context, bail};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn_test_server(
        chunk_delay: Duration,
    ) -> Result<Option<(SocketAddr, tokio::task::JoinHandle<()>)>> {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let locks = Arc::new(ThreadLocks::new());
        let threads = Arc::new(ThreadManager::new(storage.clone(), locks.clone()));
        let runs = RunManager::new(
            storage.clone(),
            threads.clone(),
            locks,
            Arc::new(EchoExecutor::new(chunk_delay)),
            RunsConfig::default(),
        );
        let crons = CronScheduler::new(
            storage,
            runs.clone(),
            threads.clone(),
            SchedulerConfig::default(),
        );
        let app = build_router(
            RuntimeApiState {
                threads,
                runs,
                crons,
            },
            &[],
        );
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Some((addr, handle)))
    }

    fn parse_sse_body(body: &str) -> Result<Vec<(String, Value)>> {
        let mut frames = Vec::new();
        for frame in body.split("\n\n").filter(|frame| !frame.is_empty()) {
            let mut event_name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event_name = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = Some(rest.to_string());
                }
            }
            let event_name = event_name.context("missing SSE event field")?;
            let data = data.context("missing SSE data field")?;
            let payload = serde_json::from_str(&data)
                .with_context(|| format!("invalid SSE data payload: {data}"))?;
            frames.push((event_name, payload));
        }
        Ok(frames)
    }

    fn said(text: &str) -> Value {
        json!({ "messages": [{ "type": "human", "content": text }] })
    }

    #[tokio::test]
    async fn thread_endpoints_work() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();

        let ok: Value = client
            .get(format!("http://{addr}/ok"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(ok, json!({ "ok": true }));

        let created: Value = client
            .post(format!("http://{addr}/threads"))
            .json(&json!({ "thread_id": "t1", "metadata": { "team": "a" } }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(created["status"], "idle");

        let duplicate = client
            .post(format!("http://{addr}/threads"))
            .json(&json!({ "thread_id": "t1" }))
            .send()
            .await?;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        let body: Value = duplicate.json().await?;
        assert_eq!(body["code"], "conflict");

        let found: Vec<Value> = client
            .post(format!("http://{addr}/threads/search"))
            .json(&json!({ "metadata": { "team": "a" } }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(found.len(), 1);

        let updated: Value = client
            .post(format!("http://{addr}/threads/t1/state"))
            .json(&json!({ "values": { "k": 1 } }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(updated["values"]["k"], 1);

        let current: Value = client
            .get(format!("http://{addr}/threads/t1/state"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(current["values"], json!({ "k": 1 }));
        assert_eq!(current["checkpoint"]["thread_id"], "t1");

        let history: Vec<Value> = client
            .get(format!("http://{addr}/threads/t1/history?limit=5"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(history.len(), 1);

        let deleted = client
            .delete(format!("http://{addr}/threads/t1"))
            .send()
            .await?;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = client.get(format!("http://{addr}/threads/t1")).send().await?;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: Value = missing.json().await?;
        assert_eq!(body["code"], "not_found");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn stream_endpoint_sends_ordered_frames() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/threads"))
            .json(&json!({ "thread_id": "t1" }))
            .send()
            .await?
            .error_for_status()?;

        let resp = client
            .post(format!("http://{addr}/threads/t1/runs/stream"))
            .json(&json!({ "assistant_id": "agent", "input": said("hello world") }))
            .send()
            .await?
            .error_for_status()?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));
        let location = resp
            .headers()
            .get(reqwest::header::CONTENT_LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(location.starts_with("/threads/t1/runs/"));

        let body = tokio::time::timeout(Duration::from_secs(5), resp.text())
            .await
            .context("timed out reading SSE body")??;
        let frames = parse_sse_body(&body)?;
        let events: Vec<&str> = frames.iter().map(|(event, _)| event.as_str()).collect();
        assert_eq!(
            events,
            vec![
                "metadata",
                "values",
                "messages/metadata",
                "messages/partial",
                "messages/partial",
                "updates",
                "values",
            ]
        );
        let run_id = frames[0].1["run_id"].as_str().unwrap_or_default().to_string();
        assert!(location.ends_with(&run_id));
        assert_eq!(frames[4].1[0]["content"], "hello world");
        assert_eq!(frames[6].1["messages"][1]["content"], "hello world");

        let replay = client
            .get(format!("http://{addr}/threads/t1/runs/{run_id}/stream"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let last = body
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .last()
            .unwrap_or_default();
        assert_eq!(replay, format!("{last}\n\n"));

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn stream_mode_filters_frames() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let body = reqwest::Client::new()
            .post(format!("http://{addr}/runs/stream"))
            .json(&json!({
                "assistant_id": "agent",
                "input": said("just values"),
                "stream_mode": "values",
            }))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let frames = parse_sse_body(&body)?;
        let events: Vec<&str> = frames.iter().map(|(event, _)| event.as_str()).collect();
        assert_eq!(events, vec!["metadata", "values", "values"]);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn reject_strategy_returns_conflict() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(100)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/threads"))
            .json(&json!({ "thread_id": "t1" }))
            .send()
            .await?
            .error_for_status()?;

        let first: Value = client
            .post(format!("http://{addr}/threads/t1/runs"))
            .json(&json!({ "assistant_id": "agent", "input": said("one two three four five") }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(first["status"], "running");
        let run_id = first["run_id"].as_str().context("run id")?.to_string();

        let rejected = client
            .post(format!("http://{addr}/threads/t1/runs"))
            .json(&json!({ "assistant_id": "agent", "multitask_strategy": "reject" }))
            .send()
            .await?;
        assert_eq!(rejected.status(), StatusCode::CONFLICT);
        let body: Value = rejected.json().await?;
        assert_eq!(body["code"], "conflict");

        let joined: Value = client
            .get(format!("http://{addr}/threads/t1/runs/{run_id}/join"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(joined["messages"][1]["content"], "one two three four five");

        let run: Value = client
            .get(format!("http://{addr}/threads/t1/runs/{run_id}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(run["status"], "success");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn wait_endpoints_return_values_or_envelope() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();

        let values: Value = client
            .post(format!("http://{addr}/runs/wait"))
            .json(&json!({ "assistant_id": "agent", "input": said("ping") }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(values["messages"][1]["content"], "ping");

        let invalid = client
            .post(format!("http://{addr}/runs/wait"))
            .json(&json!({ "input": said("ping") }))
            .send()
            .await?;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = invalid.json().await?;
        assert_eq!(body["code"], "validation_error");

        let unknown = client
            .post(format!("http://{addr}/threads/ghost/runs/wait"))
            .json(&json!({ "assistant_id": "agent" }))
            .send()
            .await?;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn malformed_requests_use_error_envelope() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();

        let cases = [
            (json!({}), StatusCode::UNPROCESSABLE_ENTITY),
            (json!({ "assistant_id": 5 }), StatusCode::UNPROCESSABLE_ENTITY),
            (
                json!({ "assistant_id": "agent", "multitask_strategy": "sometimes" }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (body, expected) in cases {
            let response = client
                .post(format!("http://{addr}/runs"))
                .json(&body)
                .send()
                .await?;
            assert_eq!(response.status(), expected, "body {body}");
            let envelope: Value = response.json().await?;
            assert_eq!(envelope["code"], "validation_error", "body {body}");
            assert!(envelope["error"].is_string());
        }

        let broken = client
            .post(format!("http://{addr}/runs"))
            .header(header::CONTENT_TYPE, "application/json")
            .body("{ not json")
            .send()
            .await?;
        assert_eq!(broken.status(), StatusCode::BAD_REQUEST);
        let envelope: Value = broken.json().await?;
        assert_eq!(envelope["code"], "validation_error");

        let untyped = client
            .post(format!("http://{addr}/runs"))
            .body("{}")
            .send()
            .await?;
        assert_eq!(untyped.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let envelope: Value = untyped.json().await?;
        assert_eq!(envelope["code"], "validation_error");

        let bad_query = client
            .post(format!("http://{addr}/runs/r-missing/cancel?wait=maybe"))
            .send()
            .await?;
        assert_eq!(bad_query.status(), StatusCode::BAD_REQUEST);
        let envelope: Value = bad_query.json().await?;
        assert_eq!(envelope["code"], "validation_error");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn cancel_endpoint_interrupts_run() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(200)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/threads"))
            .json(&json!({ "thread_id": "t1" }))
            .send()
            .await?
            .error_for_status()?;
        let run: Value = client
            .post(format!("http://{addr}/threads/t1/runs"))
            .json(&json!({ "assistant_id": "agent", "input": said("a b c d e f g h") }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let run_id = run["run_id"].as_str().context("run id")?;

        let cancelled: Value = client
            .post(format!(
                "http://{addr}/threads/t1/runs/{run_id}/cancel?wait=true&action=interrupt"
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(cancelled["status"], "interrupted");
        assert_eq!(cancelled["error"]["code"], "executor_cancelled");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn cron_endpoints_work() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();

        let bad = client
            .post(format!("http://{addr}/runs/crons"))
            .json(&json!({ "assistant_id": "agent", "schedule": "not a schedule" }))
            .send()
            .await?;
        assert_eq!(bad.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let cron: Value = client
            .post(format!("http://{addr}/runs/crons"))
            .json(&json!({ "assistant_id": "agent", "schedule": "0 0 1 1 *" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cron_id = cron["cron_id"].as_str().context("cron id")?;
        if cron["next_run_date"].is_null() {
            bail!("cron was not scheduled: {cron}");
        }

        let count: usize = client
            .post(format!("http://{addr}/runs/crons/count"))
            .json(&json!({ "assistant_id": "agent" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(count, 1);

        let patched: Value = client
            .patch(format!("http://{addr}/runs/crons/{cron_id}"))
            .json(&json!({ "schedule": "0 12 * * 1-5" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(patched["schedule"], "0 12 * * 1-5");

        let deleted = client
            .delete(format!("http://{addr}/runs/crons/{cron_id}"))
            .send()
            .await?;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let missing = client
            .get(format!("http://{addr}/runs/crons/{cron_id}"))
            .send()
            .await?;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn owner_header_scopes_threads() -> Result<()> {
        let Some((addr, handle)) = spawn_test_server(Duration::from_millis(1)).await? else {
            return Ok(());
        };
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/threads"))
            .header(OWNER_HEADER, "alice")
            .json(&json!({ "thread_id": "mine" }))
            .send()
            .await?
            .error_for_status()?;

        let other = client
            .get(format!("http://{addr}/threads/mine"))
            .header(OWNER_HEADER, "bob")
            .send()
            .await?;
        assert_eq!(other.status(), StatusCode::NOT_FOUND);

        let owned = client
            .get(format!("http://{addr}/threads/mine"))
            .header(OWNER_HEADER, "alice")
            .send()
            .await?;
        assert_eq!(owned.status(), StatusCode::OK);

        handle.abort();
        Ok(())
    }
}
