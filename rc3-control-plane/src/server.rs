use crate::config::Config;
use crate::features::cluster::repo::ClusterRepository;
use crate::features::identity::{HeaderIdentityResolver, IdentityResolver};
use crate::features::instance_management::controller::InstanceController;
use crate::features::instance_management::service::InstanceService;
use crate::features::inventory::controller::InventoryController;
use crate::features::inventory::service::InventoryService;
use crate::features::observability::controller::ObservabilityController;
use crate::features::observability::service::ObservabilityService;
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{
    CreateInstanceRequest, DeleteInstanceRequest, ErrorBody, ListInstancesResponse, Requester,
};
use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use rc3_core::{ErrorCode, ErrorResponse, FirstNode, ProfileResolver};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything a request handler needs. Built once at startup.
pub struct AppState {
    pub instances: Arc<InstanceController>,
    pub inventory: Arc<InventoryController>,
    pub identity: Arc<dyn IdentityResolver>,
    pub metrics: Arc<ObservabilityController>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(cluster: Arc<dyn ClusterRepository>, config: &Config) -> anyhow::Result<Self> {
        let observability =
            Arc::new(ObservabilityService::standalone().context("failed to register metrics")?);
        let identity = HeaderIdentityResolver::from_config(&config.auth, &config.development)
            .context("failed to configure identity resolution")?;

        let inventory_service = Arc::new(InventoryService::new(cluster.clone()));
        let instance_service = InstanceService::new(
            cluster,
            inventory_service.clone(),
            Arc::new(FirstNode),
            ProfileResolver::new(
                config.proxmox.os_template.clone(),
                config.proxmox.instance_storage.clone(),
            ),
            observability.clone(),
        );

        Ok(Self {
            instances: Arc::new(InstanceController::new(Arc::new(instance_service))),
            inventory: Arc::new(InventoryController::new(inventory_service)),
            identity: Arc::new(identity),
            metrics: Arc::new(ObservabilityController::new(observability)),
            request_timeout: Duration::from_secs(config.proxmox.request_timeout_secs),
        })
    }

    /// One budget for every cluster call made on behalf of a request
    fn deadline(&self) -> Instant {
        Instant::now() + self.request_timeout
    }

    fn requester(&self, headers: &HeaderMap) -> Result<Requester, ApiError> {
        self.identity.resolve(headers).ok_or_else(|| {
            let err = ControlPlaneError::Unauthenticated(
                "request carries no requester identity".to_string(),
            );
            ApiError::from(ErrorResponse::from(err))
        })
    }
}

/// HTTP error with the `{error, error_details}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: Option<ErrorCode>,
    details: String,
}

impl ApiError {
    pub fn new(status: StatusCode, details: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            details: details.into(),
        }
    }
}

impl From<ErrorResponse> for ApiError {
    fn from(err: ErrorResponse) -> Self {
        Self {
            status: status_for(err.error_code),
            code: Some(err.error_code),
            details: err.message,
        }
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorCode::UpstreamUnavailable | ErrorCode::NoCapacity | ErrorCode::AllocationConflict => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                status = self.status.as_u16(),
                code = self.code.map(|code| code.as_str()).unwrap_or("INTERNAL"),
                error = %self.details,
                "Request failed"
            );
        }

        let body = ErrorBody {
            error: self
                .status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            error_details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/:id", delete(delete_instance));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default();
                    info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::custom(handle_panic)),
        )
        .with_state(state)
}

async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListInstancesResponse>, ApiError> {
    let instances = state.inventory.list_instances(state.deadline()).await?;
    Ok(Json(ListInstancesResponse { instances }))
}

async fn create_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let requester = state.requester(&headers)?;
    let Json(request) =
        payload.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let created = state
        .instances
        .create_instance(request, &requester, state.deadline())
        .await?;

    let location = format!("/api/instances/{}", created.id);
    Ok((StatusCode::CREATED, [(LOCATION, location)]).into_response())
}

async fn delete_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let requester = state.requester(&headers)?;
    let instance_id: u64 = raw_id.parse().map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("instance id must be a positive integer, got '{raw_id}'"),
        )
    })?;

    state
        .instances
        .delete_instance(
            DeleteInstanceRequest { instance_id },
            &requester,
            state.deadline(),
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render_metrics()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "no such route")
}

async fn record_request(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| format!("{} {}", request.method(), path.as_str()))
        .unwrap_or_else(|| "unmatched".to_string());
    let started = std::time::Instant::now();

    let response = next.run(request).await;

    state.metrics.record_api_request(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let details = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %details, "Request handler panicked");

    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

/// Serve until SIGINT/SIGTERM, then give in-flight requests
/// `shutdown_timeout` to finish.
pub async fn serve(
    host: &str,
    state: Arc<AppState>,
    shutdown_timeout: Duration,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(host)
        .await
        .with_context(|| format!("failed to bind {host}"))?;
    info!(%host, "rc3 API listening");

    let (signalled_tx, signalled_rx) = oneshot::channel();
    let app = router(state);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = signalled_tx.send(());
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("server task failed")?.context("server error")?;
            return Ok(());
        }
        _ = signalled_rx => {}
    }

    info!(
        timeout_secs = shutdown_timeout.as_secs(),
        "Shutdown signal received; draining in-flight requests"
    );
    match tokio::time::timeout(shutdown_timeout, &mut server).await {
        Ok(result) => result.context("server task failed")?.context("server error")?,
        Err(_) => {
            warn!("Shutdown timeout elapsed; closing remaining connections");
            server.abort();
        }
    }

    info!("rc3 API shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
