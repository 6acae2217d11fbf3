use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use signald_bridge_net::DaemonClient;
use signald_bridge_shared::constants::{BUILD_NR, SUPPORTED_API_VERSIONS};
use signald_bridge_shared::{DaemonFrame, GroupEntry};

use crate::config::ServerConfig;
use crate::dispatcher::{self, OutgoingMessage, RecipientMode};
use crate::error::{ErrorBody, ServerError};
use crate::linking::LinkingSession;
use crate::{accounts, groups, receive};

const INVALID_REQUEST: &str = "Couldn't process request - invalid request.";

/// Where the generated OpenAPI document is served.
pub const OPENAPI_JSON: &str = "/api-doc/openapi.json";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Signal Messenger REST API",
        description = "HTTP gateway in front of a signald daemon"
    ),
    paths(
        health_check,
        about,
        register_number,
        verify_number,
        send_v1,
        send_v2,
        receive_messages,
        create_group,
        list_groups,
        delete_group,
        link_device,
    ),
    components(schemas(
        HealthResponse,
        AboutResponse,
        RegisterRequest,
        VerifyRequest,
        SendMessageV1,
        SendMessageV2,
        CreateGroupRequest,
        CreateGroupResponse,
        ErrorBody,
    )),
    tags(
        (name = "General", description = "Service information"),
        (name = "Devices", description = "Registration and linking"),
        (name = "Messages", description = "Sending and receiving"),
        (name = "Groups", description = "Group management"),
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<DaemonClient>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let client = DaemonClient::new(config.socket_path.clone(), config.request_timeout);
        Self {
            client: Arc::new(client),
            config: Arc::new(config),
        }
    }
}

#[allow(deprecated)]
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/about", get(about))
        .route("/v1/register/{number}", post(register_number))
        .route("/v1/register/{number}/verify/{token}", post(verify_number))
        .route("/v1/send", post(send_v1))
        .route("/v2/send", post(send_v2))
        .route("/v1/receive/{number}", get(receive_messages))
        .route("/v1/groups/{number}", post(create_group).get(list_groups))
        .route("/v1/groups/{number}/{groupid}", delete(delete_group))
        .route("/v1/link", get(link_device))
        .merge(SwaggerUi::new("/swagger").url(OPENAPI_JSON, ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize, ToSchema)]
struct HealthResponse {
    #[schema(value_type = String, example = "ok")]
    status: &'static str,
    #[schema(value_type = String)]
    version: &'static str,
    daemon_connected: bool,
}

#[derive(Serialize, ToSchema)]
struct AboutResponse {
    #[schema(value_type = Vec<String>, example = json!(["v1", "v2"]))]
    versions: [&'static str; 2],
    build: u32,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(default)]
struct RegisterRequest {
    /// Ask for the code by voice call instead of SMS
    use_voice: bool,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(default)]
struct VerifyRequest {
    /// Registration lock PIN, if the account has one
    pin: Option<String>,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(default)]
struct SendMessageV1 {
    #[schema(example = "+431212131491291")]
    number: String,
    recipients: Vec<String>,
    message: String,
    base64_attachment: Option<String>,
    is_group: bool,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(default)]
struct SendMessageV2 {
    #[schema(example = "+431212131491291")]
    number: String,
    /// Phone numbers, or `group.`-prefixed group ids; not both
    recipients: Vec<String>,
    message: String,
    base64_attachments: Vec<String>,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(default)]
struct CreateGroupRequest {
    name: String,
    members: Vec<String>,
}

#[derive(Serialize, ToSchema)]
struct CreateGroupResponse {
    /// Group id in the `group.` form accepted by `/v2/send`
    id: String,
}

#[derive(Deserialize)]
struct ReceiveParams {
    timeout: Option<String>,
}

#[derive(Deserialize)]
struct LinkParams {
    device_name: Option<String>,
}

/// Parse a JSON body, mapping any failure to the generic validation message.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ServerError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Rejected request body");
        ServerError::Validation(INVALID_REQUEST.into())
    })
}

/// Like [`parse_body`], but an empty body means all defaults.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ServerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

/// Gateway liveness and daemon connection state.
#[utoipa::path(
    get,
    path = "/health",
    tag = "General",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        daemon_connected: state.client.transport().is_connected().await,
    })
}

/// Lists general information about the API.
#[utoipa::path(
    get,
    path = "/v1/about",
    tag = "General",
    responses((status = 200, description = "Supported API versions and build", body = AboutResponse))
)]
async fn about() -> Json<AboutResponse> {
    Json(AboutResponse {
        versions: SUPPORTED_API_VERSIONS,
        build: BUILD_NR,
    })
}

/// Register a phone number.
///
/// Registers a phone number with the signal network.
#[utoipa::path(
    post,
    path = "/v1/register/{number}",
    tag = "Devices",
    params(("number" = String, Path, description = "Registered phone number")),
    request_body(content = RegisterRequest, description = "Optional; an empty body means SMS"),
    responses(
        (status = 201, description = "Verification code requested"),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn register_number(
    State(state): State<AppState>,
    Path(number): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let req: RegisterRequest = parse_optional_body(&body)?;
    accounts::register(&state.client, &number, req.use_voice).await?;
    Ok(StatusCode::CREATED)
}

/// Verify a registered phone number.
///
/// Verifies a registered phone number with the signal network.
#[utoipa::path(
    post,
    path = "/v1/register/{number}/verify/{token}",
    tag = "Devices",
    params(
        ("number" = String, Path, description = "Registered phone number"),
        ("token" = String, Path, description = "Verification code"),
    ),
    request_body(content = VerifyRequest, description = "Optional registration lock PIN"),
    responses(
        (status = 201, description = "Number verified"),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn verify_number(
    State(state): State<AppState>,
    Path((number, token)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let req: VerifyRequest = parse_optional_body(&body)?;
    accounts::verify(&state.client, &number, &token, req.pin.as_deref()).await?;
    Ok(StatusCode::CREATED)
}

/// Send a signal message.
///
/// Send a signal message to one group or to one or more numbers. Deprecated,
/// use `/v2/send` instead.
///
/// Recipients are sent to one after the other. If a send fails, the ones
/// before it have already been delivered and are not rolled back.
#[utoipa::path(
    post,
    path = "/v1/send",
    tag = "Messages",
    request_body = SendMessageV1,
    responses(
        (status = 201, description = "Delivered to every recipient"),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
#[deprecated(note = "use send_v2")]
async fn send_v1(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ServerError> {
    let req: SendMessageV1 = parse_body(&body)?;
    let outgoing = OutgoingMessage {
        number: req.number,
        message: req.message,
        recipients: req.recipients,
        base64_attachments: req
            .base64_attachment
            .filter(|a| !a.is_empty())
            .into_iter()
            .collect(),
        mode: RecipientMode::Explicit {
            is_group: req.is_group,
        },
    };

    dispatcher::send_message(&state.client, state.config.attachment_dir.clone(), outgoing)
        .await?;
    Ok(StatusCode::CREATED)
}

/// Send a signal message.
///
/// Send a signal message to groups or to numbers, never both in one call.
///
/// Recipients are sent to one after the other. If a send fails, the ones
/// before it have already been delivered and are not rolled back.
#[utoipa::path(
    post,
    path = "/v2/send",
    tag = "Messages",
    request_body = SendMessageV2,
    responses(
        (status = 201, description = "Delivered to every recipient"),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn send_v2(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ServerError> {
    let req: SendMessageV2 = parse_body(&body)?;
    let outgoing = OutgoingMessage {
        number: req.number,
        message: req.message,
        recipients: req.recipients,
        base64_attachments: req.base64_attachments,
        mode: RecipientMode::Mixed,
    };

    dispatcher::send_message(&state.client, state.config.attachment_dir.clone(), outgoing)
        .await?;
    Ok(StatusCode::CREATED)
}

/// Receive signal messages.
///
/// Collects incoming messages until the daemon marks the batch complete.
#[utoipa::path(
    get,
    path = "/v1/receive/{number}",
    tag = "Messages",
    params(
        ("number" = String, Path, description = "Registered phone number"),
        ("timeout" = Option<u64>, Query, description = "Seconds to wait for the batch"),
    ),
    responses(
        (status = 200, description = "Frames as sent by the daemon, done marker last", body = Vec<Object>),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Batch did not complete in time", body = ErrorBody),
    )
)]
async fn receive_messages(
    State(state): State<AppState>,
    Path(number): Path<String>,
    Query(params): Query<ReceiveParams>,
) -> Result<Json<Vec<DaemonFrame>>, ServerError> {
    let deadline = match params.timeout.as_deref() {
        None | Some("") => state.config.receive_timeout,
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                return Err(ServerError::Validation(
                    "Invalid timeout, expected a positive number of seconds".into(),
                ))
            }
        },
    };

    let frames = receive::receive(&state.client, &number, deadline).await?;
    Ok(Json(frames))
}

/// Create a new signal messenger group.
#[utoipa::path(
    post,
    path = "/v1/groups/{number}",
    tag = "Groups",
    params(("number" = String, Path, description = "Registered phone number")),
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = CreateGroupResponse),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn create_group(
    State(state): State<AppState>,
    Path(number): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateGroupResponse>), ServerError> {
    let req: CreateGroupRequest = parse_body(&body)?;
    let id = groups::create_group(&state.client, &number, &req.name, &req.members).await?;
    Ok((StatusCode::CREATED, Json(CreateGroupResponse { id })))
}

/// List all signal messenger groups.
#[utoipa::path(
    get,
    path = "/v1/groups/{number}",
    tag = "Groups",
    params(("number" = String, Path, description = "Registered phone number")),
    responses(
        (status = 200, description = "Groups the account belongs to", body = Vec<Object>),
        (status = 400, description = "Invalid request or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn list_groups(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Result<Json<Vec<GroupEntry>>, ServerError> {
    let entries = groups::list_groups(&state.client, &number).await?;
    Ok(Json(entries))
}

/// Leave a signal messenger group.
#[utoipa::path(
    delete,
    path = "/v1/groups/{number}/{groupid}",
    tag = "Groups",
    params(
        ("number" = String, Path, description = "Registered phone number"),
        ("groupid" = String, Path, description = "Group id in `group.` form"),
    ),
    responses(
        (status = 200, description = "Group left"),
        (status = 400, description = "Invalid group id or rejected by the daemon", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn delete_group(
    State(state): State<AppState>,
    Path((number, group_id)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    groups::leave_group(&state.client, &number, &group_id).await?;
    Ok(StatusCode::OK)
}

/// Link device and generate QR code.
///
/// Start linking a new device and answer with the QR code to scan. The
/// confirmation is awaited in the background.
#[utoipa::path(
    get,
    path = "/v1/link",
    tag = "Devices",
    params(("device_name" = String, Query, description = "Name shown on the primary device")),
    responses(
        (status = 200, description = "QR code of the linking URI", content_type = "image/png", body = Vec<u8>),
        (status = 400, description = "Missing device name", body = ErrorBody),
        (status = 502, description = "Daemon unreachable", body = ErrorBody),
        (status = 504, description = "Daemon did not answer in time", body = ErrorBody),
    )
)]
async fn link_device(
    State(state): State<AppState>,
    Query(params): Query<LinkParams>,
) -> Result<Response, ServerError> {
    let device_name = params.device_name.unwrap_or_default();
    let mut session = LinkingSession::new(
        state.config.socket_path.clone(),
        &device_name,
        state.config.request_timeout,
        state.config.link_timeout,
    )?;

    let png = session.start().await?;
    info!(device = %device_name, state = ?session.state(), "Linking QR code issued");
    session.spawn_confirmation();

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
