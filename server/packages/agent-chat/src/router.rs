use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_chat_error::{ChatError, ErrorType, ProblemDetails};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::app::AppContext;
use crate::bridge::{ExtensionMessage, WebviewMessage};
use crate::config::RedactedConfig;
use crate::history_view::{build_tree, HistoryNode, HistoryNodeKind};
use crate::message::{Message, MessageRole};
use crate::session::SessionStatus;
use crate::ui;

pub const DEFAULT_PORT: u16 = 2470;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryTreeResponse {
    pub nodes: Vec<HistoryNode>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub settings_path: String,
    pub config: RedactedConfig,
    pub status: SessionStatus,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_history,
        get_history_tree,
        get_config,
        get_webview_events,
        post_webview
    ),
    components(
        schemas(
            HealthResponse,
            HistoryResponse,
            HistoryTreeResponse,
            ConfigResponse,
            RedactedConfig,
            SessionStatus,
            Message,
            MessageRole,
            HistoryNode,
            HistoryNodeKind,
            ExtensionMessage,
            WebviewMessage,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "history", description = "Chat history"),
        (name = "webview", description = "Chat page bridge")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new(format!(
            "http://localhost:{DEFAULT_PORT}"
        ))]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Chat(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub fn build_router(context: Arc<AppContext>) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/history", get(get_history))
        .route("/history/tree", get(get_history_tree))
        .route("/config", get(get_config))
        .route("/webview", post(post_webview))
        .route("/webview/events", get(get_webview_events))
        .route("/openapi.json", get(get_openapi))
        .with_state(context);

    let router = Router::new()
        .nest("/v1", v1_router)
        .merge(ui::router())
        .fallback(not_found);

    let http_logging = match std::env::var("AGENT_CHAT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if !http_logging {
        return router;
    }
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });
    router.layer(trace_layer)
}

const SERVER_INFO: &str = "\
This is an agent-chat server. Available endpoints:\n\
  - GET  /                  - Chat page\n\
  - GET  /v1/health         - Health check\n\
  - GET  /v1/history        - Chat history\n\
  - GET  /v1/history/tree   - Chat history as a tree\n\
  - GET  /v1/config         - Active settings\n\
  - GET  /v1/webview/events - Chat page event stream (SSE)\n\
  - POST /v1/webview        - Chat page requests\n\
  - GET  /v1/openapi.json   - OpenAPI document";

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/history",
    responses((status = 200, body = HistoryResponse)),
    tag = "history"
)]
async fn get_history(State(context): State<Arc<AppContext>>) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        messages: context.session().history(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/history/tree",
    responses((status = 200, body = HistoryTreeResponse)),
    tag = "history"
)]
async fn get_history_tree(State(context): State<Arc<AppContext>>) -> Json<HistoryTreeResponse> {
    let history = context.session().history();
    Json(HistoryTreeResponse {
        nodes: build_tree(&history),
    })
}

#[utoipa::path(
    get,
    path = "/v1/config",
    responses((status = 200, body = ConfigResponse)),
    tag = "meta"
)]
async fn get_config(State(context): State<Arc<AppContext>>) -> Json<ConfigResponse> {
    let session = context.session();
    Json(ConfigResponse {
        settings_path: context
            .config_source()
            .path()
            .to_string_lossy()
            .into_owned(),
        config: session.config().redacted(),
        status: session.status(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/webview/events",
    responses((status = 200, description = "SSE stream of ExtensionMessage envelopes")),
    tag = "webview"
)]
async fn get_webview_events(
    State(context): State<Arc<AppContext>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = context.bridge().sse_stream();
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[utoipa::path(
    post,
    path = "/v1/webview",
    request_body = WebviewMessage,
    responses(
        (status = 202, description = "Envelope accepted"),
        (status = 400, body = ProblemDetails),
        (status = 415, body = ProblemDetails)
    ),
    tag = "webview"
)]
async fn post_webview(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if !is_json_content_type(&headers) {
        return Err(ChatError::UnsupportedMediaType {
            message: "content-type must be application/json".to_string(),
        }
        .into());
    }
    let message: WebviewMessage =
        serde_json::from_slice(&body).map_err(|err| ChatError::InvalidRequest {
            message: format!("invalid webview envelope: {err}"),
        })?;
    context.bridge().handle(message).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
}
