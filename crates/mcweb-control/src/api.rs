use axum::{
    Extension, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mcweb_core::{ErrorPayload, Requester, ServerSnapshot, SupervisorError};
use serde::{Deserialize, Serialize};
use specta::Type;

use crate::{
    security::{self, RequestMeta},
    state::AppState,
};

/// Success body: a human-readable message plus optional data.
#[derive(Debug, Serialize)]
pub struct ApiMessage<T> {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiMessage<T> {
    fn with_data(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            message: message.into(),
            data: Some(data),
        })
    }
}

impl ApiMessage<()> {
    fn text(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
            data: None,
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(flatten)]
    payload: ErrorPayload,
    request_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    payload: ErrorPayload,
    request_id: String,
}

impl ApiError {
    fn supervisor(err: &SupervisorError, meta: &RequestMeta) -> Self {
        Self {
            status: status_for(err),
            payload: err.to_payload(),
            request_id: meta.request_id.clone(),
        }
    }

    fn bad_request(message: impl Into<String>, meta: &RequestMeta) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            payload: ErrorPayload {
                code: "bad_request".to_string(),
                message: message.into(),
                hint: None,
            },
            request_id: meta.request_id.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            payload: self.payload,
            request_id: self.request_id,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::NotFound => StatusCode::NOT_FOUND,
        SupervisorError::AlreadyRunning(_) | SupervisorError::NotRunning(_) => {
            StatusCode::CONFLICT
        }
        // The forced shutdown is underway; the request was accepted.
        SupervisorError::StopTimeout(_) => StatusCode::ACCEPTED,
        SupervisorError::Unauthorized => StatusCode::FORBIDDEN,
        SupervisorError::ConsoleUnresponsive(_) => StatusCode::SERVICE_UNAVAILABLE,
        SupervisorError::NoStartupScript(_)
        | SupervisorError::StartFailed { .. }
        | SupervisorError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn requester(state: &AppState, headers: &HeaderMap, meta: &RequestMeta) -> Result<Requester, ApiError> {
    let token = security::session_token(headers);
    Requester::resolve(state.identity.as_ref(), token.as_deref())
        .map_err(|e| ApiError::supervisor(&e, meta))
}

#[derive(Debug, Deserialize, Type)]
pub struct ManageRequest {
    pub name: String,
    pub action: String,
}

#[derive(Debug, Deserialize, Type)]
pub struct CommandRequest {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Serialize, Type)]
pub struct StartedData {
    pub pid: u32,
}

#[derive(Debug, Serialize, Type)]
pub struct RefreshData {
    pub servers: u32,
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    servers: usize,
    running: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        servers: state.supervisor.registry().len().await,
        running: state.supervisor.running().len().await,
    })
}

pub async fn list(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage<Vec<ServerSnapshot>>>, ApiError> {
    let requester = requester(&state, &headers, &meta)?;
    let servers = state.supervisor.list_servers(&requester).await;
    Ok(ApiMessage::with_data(format!("{} servers", servers.len()), servers))
}

pub async fn manage(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(req): Json<ManageRequest>,
) -> Result<Response, ApiError> {
    let requester = requester(&state, &headers, &meta)?;
    let supervisor = &state.supervisor;

    match req.action.trim().to_ascii_lowercase().as_str() {
        "start" => {
            let started = supervisor
                .start(&req.name, &requester)
                .await
                .map_err(|e| ApiError::supervisor(&e, &meta))?;
            Ok(ApiMessage::with_data(
                format!("Server {} started", req.name),
                StartedData { pid: started.pid },
            )
            .into_response())
        }
        "stop" => {
            supervisor
                .stop(&req.name, &requester)
                .await
                .map_err(|e| ApiError::supervisor(&e, &meta))?;
            Ok(ApiMessage::text(format!("Server {} stopped", req.name)).into_response())
        }
        _ => Err(ApiError::bad_request("invalid server action", &meta)),
    }
}

pub async fn command(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(req): Json<CommandRequest>,
) -> Result<Json<ApiMessage<()>>, ApiError> {
    let requester = requester(&state, &headers, &meta)?;
    if req.command.trim().is_empty() {
        return Err(ApiError::bad_request("command must not be empty", &meta));
    }
    state
        .supervisor
        .send_command(&req.name, &req.command, &requester)
        .await
        .map_err(|e| ApiError::supervisor(&e, &meta))?;
    Ok(ApiMessage::text(format!("Command sent to {}", req.name)))
}

pub async fn refresh(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage<RefreshData>>, ApiError> {
    let requester = requester(&state, &headers, &meta)?;
    let servers = state
        .supervisor
        .refresh(&requester)
        .await
        .map_err(|e| ApiError::supervisor(&e, &meta))?;
    Ok(ApiMessage::with_data(
        "Server list refreshed",
        RefreshData {
            servers: u32::try_from(servers).unwrap_or(u32::MAX),
        },
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage<()>>, ApiError> {
    let token = security::session_token(&headers)
        .ok_or_else(|| ApiError::supervisor(&SupervisorError::Unauthorized, &meta))?;
    if !state.identity.unbind(&token) {
        return Err(ApiError::supervisor(&SupervisorError::Unauthorized, &meta));
    }
    if let Err(e) = state.identity.maybe_persist().await {
        tracing::warn!(request_id = %meta.request_id, error = %format!("{e:#}"), "session datastore write failed");
    }
    Ok(ApiMessage::text("Logged out"))
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/list", post(list))
        .route("/manage", post(manage))
        .route("/command", post(command))
        .route("/refresh", post(refresh));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/logout", post(logout))
        .nest("/api", api)
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
