//! REST surface of the dashboard. Handlers only translate between HTTP and
//! [`LifecycleManager`](crate::lifecycle::LifecycleManager) calls.

use axum::{
    Json, Router,
    extract::{Multipart, Query, State, multipart::MultipartRejection},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use botpanel_process::StatusSnapshot;
use serde::{Deserialize, Serialize};

use crate::error_payload::ActionResponse;
use crate::lifecycle::LifecycleError;
use crate::request_meta;
use crate::state::AppState;

const CREDENTIAL_FIELDS: [&str; 2] = ["appstate", "file"];
const OWNER_FIELDS: [&str; 2] = ["ownerId", "ownerUID"];

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start))
        .route("/start", post(start))
        .route("/api/stop", post(stop))
        .route("/stop", post(stop))
        .route("/api/clear", post(clear))
        .route("/api/status", get(status))
        .route("/api/logs", get(logs))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}

fn status_for(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::Validation(_) | LifecycleError::CredentialParse(_) => {
            StatusCode::BAD_REQUEST
        }
        LifecycleError::AlreadyRunning
        | LifecycleError::NotRunning
        | LifecycleError::StillRunning
        | LifecycleError::Busy => StatusCode::CONFLICT,
        LifecycleError::LoginFailed(_) => StatusCode::BAD_GATEWAY,
        LifecycleError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn action_response(result: Result<String, LifecycleError>) -> Response {
    match result {
        Ok(message) => (StatusCode::OK, Json(ActionResponse::ok(message))).into_response(),
        Err(err) => (
            status_for(&err),
            Json(ActionResponse::failure(err.code(), err.to_string())),
        )
            .into_response(),
    }
}

#[derive(Debug, Default)]
struct StartForm {
    credential: Vec<u8>,
    owner_id: String,
}

async fn read_start_form(mut multipart: Multipart) -> Result<StartForm, LifecycleError> {
    let mut form = StartForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(err) => {
                return Err(LifecycleError::Validation(format!(
                    "malformed upload: {err}"
                )));
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        if CREDENTIAL_FIELDS.contains(&name.as_str()) {
            form.credential = field
                .bytes()
                .await
                .map_err(|e| LifecycleError::Validation(format!("malformed upload: {e}")))?
                .to_vec();
        } else if OWNER_FIELDS.contains(&name.as_str()) {
            form.owner_id = field
                .text()
                .await
                .map_err(|e| LifecycleError::Validation(format!("malformed upload: {e}")))?;
        }
    }
    Ok(form)
}

async fn start(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            return action_response(Err(LifecycleError::Validation(format!(
                "expected a multipart upload: {rejection}"
            ))));
        }
    };
    let form = match read_start_form(multipart).await {
        Ok(f) => f,
        Err(err) => return action_response(Err(err)),
    };
    action_response(state.manager.start(&form.credential, &form.owner_id).await)
}

async fn stop(State(state): State<AppState>) -> Response {
    action_response(state.manager.stop().await)
}

async fn clear(State(state): State<AppState>) -> Response {
    action_response(state.manager.clear().await)
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.manager.status().await)
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsResponse {
    lines: Vec<String>,
    next_cursor: u64,
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Json<LogsResponse> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let (lines, next_cursor) = state
        .manager
        .logs()
        .tail(q.cursor.unwrap_or(0), limit)
        .await;
    Json(LogsResponse { lines, next_cursor })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    data_root: String,
    data_root_writable: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let store = state.manager.store();
    let data_root_writable = match store.probe_writable().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(%err, "data root is not writable");
            false
        }
    };
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        data_root: store.root().display().to_string(),
        data_root_writable,
    })
}
