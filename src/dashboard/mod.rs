//! HTTP front end of a [`Dispatcher`].
//!
//! Worker routes live under `/api`, admin routes under `/admin/:secret`.
//! Row identifiers never leave the server: tasks carry data keys only.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::PoolError;
use crate::mapper::DataKey;
use crate::node::{Dispatcher, NextTask};
use crate::scheduler::Column;
use crate::source::DataSource;
use crate::store::KvStore;
use crate::worker::{Completion, SessionContext, Verdict};

type AppState<S, D> = Arc<Dispatcher<S, D>>;

/// A [`PoolError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(PoolError);

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PoolError::NotFound(_) => StatusCode::NOT_FOUND,
            PoolError::Unauthorized => StatusCode::FORBIDDEN,
            _ => {
                tracing::error!(error = %self.0, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct NewUserResponse {
    user: String,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TaskResponse {
    Assigned {
        keys: BTreeMap<Column, DataKey>,
    },
    Exhausted,
    Finished {
        verdict: Verdict,
    },
}

#[derive(Deserialize)]
struct SubmitResultRequest {
    #[serde(default)]
    correct: bool,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DoneQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct DoneResponse {
    finished: bool,
    verdict: Option<Verdict>,
}

#[derive(Serialize)]
struct FlushResponse {
    flushed: usize,
}

pub fn router<S: KvStore, D: DataSource>(dispatcher: AppState<S, D>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/user", post(new_user_handler::<S, D>))
        .route("/api/task/:user", get(next_task_handler::<S, D>))
        .route("/api/result/:user", post(submit_result_handler::<S, D>))
        .route("/api/done/:user", get(done_handler::<S, D>))
        .route("/api/data/:key", get(data_handler::<S, D>))
        .route("/admin/:secret/users", get(list_users_handler::<S, D>))
        .route(
            "/admin/:secret/responses",
            get(list_responses_handler::<S, D>),
        )
        .route("/admin/:secret/flush", post(flush_handler::<S, D>))
        .layer(cors)
        .with_state(dispatcher)
}

/// Serves the API on `addr` until `shutdown` is cancelled.
pub async fn run_dashboard<S: KvStore, D: DataSource>(
    addr: SocketAddr,
    dispatcher: AppState<S, D>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(dispatcher);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Serving work pool API");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    tracing::info!("API server stopped");
    Ok(())
}

/// Address of the TCP peer. Forwarding headers are client-controlled and
/// ignored; behind a proxy this records the proxy.
fn client_addr(peer: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
}

async fn new_user_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
) -> ApiResult<Json<NewUserResponse>> {
    let context = SessionContext::new(
        client_addr(peer),
        uri.query().unwrap_or_default(),
    );
    let user = dispatcher.new_session(&context).await?;
    Ok(Json(NewUserResponse { user }))
}

async fn next_task_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(user): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let response = match dispatcher.next_task(&user).await? {
        NextTask::Assigned(task) => TaskResponse::Assigned { keys: task.keys },
        NextTask::Exhausted => TaskResponse::Exhausted,
        NextTask::Finished(verdict) => TaskResponse::Finished { verdict },
    };
    Ok(Json(response))
}

async fn submit_result_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(user): Path<String>,
    Json(request): Json<SubmitResultRequest>,
) -> ApiResult<StatusCode> {
    dispatcher
        .submit_result(&user, request.correct, request.response.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn done_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(user): Path<String>,
    Query(query): Query<DoneQuery>,
) -> ApiResult<Json<DoneResponse>> {
    let response = match dispatcher.completion(&user, query.force).await? {
        Completion::Finished(verdict) => DoneResponse {
            finished: true,
            verdict: Some(verdict),
        },
        Completion::InProgress => DoneResponse {
            finished: false,
            verdict: None,
        },
    };
    Ok(Json(response))
}

async fn data_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let value = dispatcher.resolve(&key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], value))
}

async fn list_users_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(secret): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(dispatcher.list_sessions(&secret).await?))
}

async fn list_responses_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(secret): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(dispatcher.list_responses(&secret).await?))
}

async fn flush_handler<S: KvStore, D: DataSource>(
    State(dispatcher): State<AppState<S, D>>,
    Path(secret): Path<String>,
) -> ApiResult<Json<FlushResponse>> {
    let flushed = dispatcher.flush_sessions(&secret).await?;
    Ok(Json(FlushResponse { flushed }))
}
