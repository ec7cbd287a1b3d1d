use std::net::Ipv4Addr;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    error::DiscoveryError,
    role::NfsRole,
    service::DiscoveryService,
    types::{HostResult, NetworkPrefix, ScanKind, ScanSnapshot, ScanTicket},
};

#[derive(Clone)]
pub struct AppState {
    service: DiscoveryService,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscoverRequest {
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkScanRequest {
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub scan_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub scan_id: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    success: bool,
    scan_id: String,
    networks: Vec<NetworkPrefix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<NetworkPrefix>,
    total_ips: u64,
    status: ScanSnapshot,
}

impl StartResponse {
    fn new(ticket: ScanTicket, kind: ScanKind) -> Self {
        let network = match kind {
            ScanKind::Network => ticket.networks.first().copied(),
            ScanKind::Discover => None,
        };
        Self {
            success: true,
            scan_id: ticket.scan_id,
            networks: ticket.networks,
            network,
            total_ips: ticket.total_targets,
            status: ticket.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct ServerResponse {
    success: bool,
    server: Option<HostResult>,
}

#[derive(Debug, Serialize)]
struct RoleResponse {
    success: bool,
    #[serde(flatten)]
    role: NfsRole,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Error type of the handlers: validation problems become 4xx, the rest 500.
pub enum ApiError {
    Discovery(DiscoveryError),
    NotReachable,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<DiscoveryError> for ApiError {
    fn from(e: DiscoveryError) -> Self {
        Self::Discovery(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<DiscoveryError>() {
            Ok(d) => Self::Discovery(d),
            Err(e) => Self::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, error, details) = match self {
            Self::Discovery(e) if e.is_validation() => (StatusCode::BAD_REQUEST, e.to_string(), None),
            Self::Discovery(e @ DiscoveryError::ScanNotFound(_)) => (StatusCode::NOT_FOUND, e.to_string(), None),
            Self::Discovery(e) => (StatusCode::CONFLICT, e.to_string(), None),
            Self::NotReachable => (StatusCode::NOT_FOUND, "Host not reachable".to_string(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            Self::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                Some(format!("{e:#}")),
            ),
        };
        (code, Json(ErrorBody { success: false, error, details })).into_response()
    }
}

/// JSON request body where an absent or blank body means `T::default()`.
///
/// The content type is not enforced; malformed JSON is a 400 with the usual error body.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(Self)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
    }
}

/// Build the API router for `service`, nested under `/api/nfs`.
pub fn router(service: DiscoveryService) -> Router {
    let state = AppState { service };

    // Progress is polled; never let an intermediary cache it.
    let status_routes = Router::new()
        .route("/discover-status", get(get_discover_status))
        .route("/scan-network-status", get(get_network_status))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let api = Router::new()
        .route("/role", get(get_role))
        .route("/discover-start", post(post_discover_start))
        .route("/scan-network-start", post(post_network_start))
        .route("/scan-cancel", post(post_cancel))
        .route("/scan-ip/{address}", get(get_scan_ip))
        .route("/networks", get(get_networks))
        .route("/exports/{server}", get(get_exports))
        .route("/mounts", get(get_mounts))
        .merge(status_routes)
        .with_state(state);

    Router::new()
        .nest("/api/nfs", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serve the API on `bind` until `shutdown` fires.
pub async fn spawn_server(bind: &str, service: DiscoveryService, shutdown: CancellationToken) -> Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving discovery API on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn post_discover_start(
    State(app): State<AppState>,
    JsonBody(req): JsonBody<DiscoverRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let ticket = app.service.start_discovery(&req.networks).await?;
    Ok(Json(StartResponse::new(ticket, ScanKind::Discover)))
}

async fn get_discover_status(State(app): State<AppState>, Query(q): Query<StatusQuery>) -> impl IntoResponse {
    Json(app.service.status(ScanKind::Discover, q.scan_id.as_deref(), None).await)
}

async fn post_network_start(
    State(app): State<AppState>,
    JsonBody(req): JsonBody<NetworkScanRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let ticket = app.service.start_network_scan(req.network.as_deref()).await?;
    Ok(Json(StartResponse::new(ticket, ScanKind::Network)))
}

async fn get_network_status(State(app): State<AppState>, Query(q): Query<StatusQuery>) -> impl IntoResponse {
    Json(
        app.service
            .status(ScanKind::Network, q.scan_id.as_deref(), q.network.as_deref())
            .await,
    )
}

async fn post_cancel(
    State(app): State<AppState>,
    JsonBody(req): JsonBody<CancelRequest>,
) -> Result<Json<ScanSnapshot>, ApiError> {
    let id = req
        .scan_id
        .filter(|id| !id.is_empty())
        .ok_or(DiscoveryError::MissingParameter("scanId"))?;
    Ok(Json(app.service.cancel(&id).await?))
}

async fn get_scan_ip(
    State(app): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ServerResponse>, ApiError> {
    let ip: Ipv4Addr = address
        .parse()
        .map_err(|_| DiscoveryError::InvalidAddress(address.clone()))?;
    let report = app.service.probe_single_address(ip).await?;
    if !report.reachable {
        return Err(ApiError::NotReachable);
    }
    Ok(Json(ServerResponse { success: true, server: report.server }))
}

async fn get_networks(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let networks = app.service.list_networks()?;
    Ok(Json(serde_json::json!({ "success": true, "networks": networks })))
}

async fn get_exports(
    State(app): State<AppState>,
    Path(server): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let exports = app.service.list_exports(&server).await?;
    Ok(Json(serde_json::json!({ "success": true, "server": server, "exports": exports })))
}

async fn get_role(State(app): State<AppState>) -> Json<RoleResponse> {
    Json(RoleResponse { success: true, role: app.service.role().await })
}

async fn get_mounts(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mounts = app.service.list_mounts().await?;
    Ok(Json(serde_json::json!({ "success": true, "mounts": mounts })))
}
