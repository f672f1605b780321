use std::{convert::Infallible, pin::Pin, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Extension, Path, Request},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_core::Stream;
use futures_util::stream::once;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokenvault_store::{Project, StoreError, StoreResult, VaultStore};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{BrokerEvent, NotificationHub, ServiceStatus};

#[derive(Clone)]
pub(crate) struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    store: Arc<dyn VaultStore>,
    notifier: NotificationHub,
    status: watch::Receiver<ServiceStatus>,
    force_close: CancellationToken,
}

impl HttpState {
    pub(crate) fn new(
        store: Arc<dyn VaultStore>,
        notifier: NotificationHub,
        status: watch::Receiver<ServiceStatus>,
        force_close: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HttpStateInner {
                store,
                notifier,
                status,
                force_close,
            }),
        }
    }

    fn notifier(&self) -> &NotificationHub {
        &self.inner.notifier
    }

    fn force_close(&self) -> &CancellationToken {
        &self.inner.force_close
    }

    fn status(&self) -> ServiceStatus {
        *self.inner.status.borrow()
    }

    /// Runs a store operation on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> anyhow::Result<StoreResult<T>>
    where
        F: FnOnce(&dyn VaultStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .context("store task did not complete")
    }
}

#[derive(Debug)]
enum ApiError {
    InvalidJson,
    MissingFields,
    TokenNotFound,
    SaveFailed(StoreError),
    ShuttingDown,
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidJson => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid JSON format" })),
            )
                .into_response(),
            ApiError::MissingFields => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Project and token are required" })),
            )
                .into_response(),
            ApiError::TokenNotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Token not found" })),
            )
                .into_response(),
            ApiError::SaveFailed(err) => {
                tracing::error!("failed to save token: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("Failed to save token: {err}") })),
                )
                    .into_response()
            }
            ApiError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "broker is shutting down" })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!("broker request failed: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoreTokenRequest {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl StoreTokenRequest {
    /// Returns the trimmed project name and the untouched token.
    fn validate(self) -> Result<(String, String), ApiError> {
        let project = self
            .project
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let token = self.token.filter(|token| !token.trim().is_empty());

        match (project, token) {
            (Some(project), Some(token)) => Ok((project, token)),
            _ => Err(ApiError::MissingFields),
        }
    }
}

/// Public view of a project; never carries token material.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectSummary {
    name: String,
    port: u16,
    api_base_url: Option<String>,
    description: Option<String>,
}

impl From<Project> for ProjectSummary {
    fn from(project: Project) -> Self {
        Self {
            name: project.name,
            port: project.port,
            api_base_url: project.api_base_url,
            description: project.description,
        }
    }
}

pub(crate) fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/store", post(store_token))
        .route("/fetch/:project", get(fetch_token))
        .route("/projects", get(list_projects))
        .route("/status", get(status))
        .route("/events", get(events))
        .fallback(not_found)
        .layer(middleware::from_fn(cut_off_on_force_close))
        .layer(Extension(state))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

async fn ping() -> impl IntoResponse {
    Json(json!({
        "message": "pong",
        "status": "TokenVault broker is running",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn store_token(
    Extension(state): Extension<HttpState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: StoreTokenRequest = serde_json::from_slice(&body).map_err(|err| {
        tracing::debug!("rejecting malformed /store body: {err}");
        ApiError::InvalidJson
    })?;
    let (project, token) = request.validate()?;

    let name = project.clone();
    let write = state
        .with_store(move |store| store.upsert_token(&name, &token))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::SaveFailed)?;

    tracing::info!(
        "token received for project '{}' (token id {})",
        project,
        write.token_id
    );
    state.notifier().publish(BrokerEvent::TokenReceived {
        project_name: project.clone(),
        received_at: Utc::now(),
    });

    Ok(Json(json!({
        "status": "saved",
        "project": project,
        "timestamp": Utc::now(),
    })))
}

async fn fetch_token(
    Extension(state): Extension<HttpState>,
    Path(project): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let token = state
        .with_store(move |store| store.latest_token(&project))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?
        .ok_or(ApiError::TokenNotFound)?;

    Ok(Json(json!({ "token": token.token_value })))
}

async fn list_projects(
    Extension(state): Extension<HttpState>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let projects = state
        .with_store(|store| store.list_projects())
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    Ok(Json(projects.into_iter().map(ProjectSummary::from).collect()))
}

async fn status(Extension(state): Extension<HttpState>) -> impl IntoResponse {
    let status = state.status();
    Json(json!({
        "running": status.state.is_running(),
        "state": status.state,
        "port": status.port,
        "timestamp": Utc::now(),
    }))
}

async fn events(
    Extension(state): Extension<HttpState>,
) -> Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>> {
    let receiver = state.notifier().subscribe();
    let initial_event =
        once(async { Ok::<Event, Infallible>(Event::default().event("ready").data("{}")) });

    let notifications = BroadcastStream::new(receiver).filter_map(|event| match event {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().event(event.name()).data(data))),
            Err(err) => {
                tracing::error!("Failed to serialize SSE payload: {err}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("event subscriber lagged by {skipped} messages");
            None
        }
    });

    // Open streams would otherwise hold a stopping server past its deadline.
    let stream = futures_util::StreamExt::take_until(
        initial_event.chain(notifications),
        state.force_close().clone().cancelled_owned(),
    );

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive");

    let boxed_stream: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream);

    Sse::new(boxed_stream).keep_alive(keep_alive)
}

/// Drops the handler and answers 503 once the server is closed forcefully.
async fn cut_off_on_force_close(
    Extension(state): Extension<HttpState>,
    request: Request,
    next: Next,
) -> Response {
    let force_close = state.force_close().clone();
    tokio::select! {
        biased;
        _ = force_close.cancelled() => ApiError::ShuttingDown.into_response(),
        response = next.run(request) => response,
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

// Loopback binding is the access boundary; browsers on any origin may call in.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
