use crate::model::MetricRecord;
use crate::store::{MetricStore, Page};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Header carrying the authenticated user id, set by the auth gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the admin flag, set by the auth gateway.
pub const USER_ADMIN_HEADER: &str = "x-user-admin";

#[derive(Clone)]
struct AppState {
    store: Arc<dyn MetricStore>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    skip: Option<usize>,
    limit: Option<usize>,
}

impl From<Pagination> for Page {
    fn from(p: Pagination) -> Self {
        Page::new(p.skip, p.limit)
    }
}

/// Caller identity, as vouched for by the authentication service in front of
/// this API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Identity {
    fn may_read(&self, owner_id: Option<i64>) -> bool {
        self.is_admin || owner_id == Some(self.user_id)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());

        let user_id = header(USER_ID_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing or invalid caller identity".into()))?;
        let is_admin = header(USER_ADMIN_HEADER)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false);

        Ok(Self { user_id, is_admin })
    }
}

pub fn create_router(store: Arc<dyn MetricStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/metrics/device/:device_id", get(get_by_device))
        .route("/metrics/owner/:owner_id", get(get_by_owner))
        .route("/metrics/type/:metric_type", get(get_by_type))
        .route("/metrics/latest/:device_id", get(get_latest))
        .with_state(state)
}

async fn get_by_device(
    State(state): State<AppState>,
    identity: Identity,
    Path(device_id): Path<String>,
    Query(params): Query<Pagination>,
) -> Result<Json<Vec<MetricRecord>>, AppError> {
    if identity.is_admin {
        let records = state.store.query_by_device(&device_id, params.into()).await?;
        info!(
            "Metrics by device: device {} admin {} count {}",
            device_id,
            identity.user_id,
            records.len()
        );
        return Ok(Json(records));
    }

    // Ownership comes from the attribution on the device's newest record.
    match state.store.latest(&device_id).await? {
        Some(latest) if !identity.may_read(latest.metric.owner_id) => {
            warn!(
                "Metrics by device denied: device {} user {}",
                device_id, identity.user_id
            );
            return Err(AppError::Forbidden(
                "Not allowed to read this device's metrics".into(),
            ));
        }
        Some(_) => {}
        None => return Ok(Json(Vec::new())),
    }

    // Records attributed to a previous owner stay hidden.
    let records = state
        .store
        .query_by_device_for_owner(&device_id, identity.user_id, params.into())
        .await?;
    info!(
        "Metrics by device: device {} user {} count {}",
        device_id,
        identity.user_id,
        records.len()
    );
    Ok(Json(records))
}

async fn get_by_owner(
    State(state): State<AppState>,
    identity: Identity,
    Path(owner_id): Path<i64>,
    Query(params): Query<Pagination>,
) -> Result<Json<Vec<MetricRecord>>, AppError> {
    if !identity.may_read(Some(owner_id)) {
        warn!(
            "Metrics by owner denied: target {} user {}",
            owner_id, identity.user_id
        );
        return Err(AppError::Forbidden(
            "Not allowed to read another owner's metrics".into(),
        ));
    }

    let records = state.store.query_by_owner(owner_id, params.into()).await?;
    info!(
        "Metrics by owner: target {} user {} count {}",
        owner_id,
        identity.user_id,
        records.len()
    );
    Ok(Json(records))
}

async fn get_by_type(
    State(state): State<AppState>,
    identity: Identity,
    Path(metric_type): Path<String>,
    Query(params): Query<Pagination>,
) -> Result<Json<Vec<MetricRecord>>, AppError> {
    let page = params.into();
    let records = if identity.is_admin {
        state.store.query_by_type(&metric_type, page).await?
    } else {
        state
            .store
            .query_by_type_for_owner(&metric_type, identity.user_id, page)
            .await?
    };

    info!(
        "Metrics by type: type {} user {} count {}",
        metric_type,
        identity.user_id,
        records.len()
    );
    Ok(Json(records))
}

async fn get_latest(
    State(state): State<AppState>,
    identity: Identity,
    Path(device_id): Path<String>,
) -> Result<Json<MetricRecord>, AppError> {
    let record = state
        .store
        .latest(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No data for device {}", device_id)))?;

    if !identity.may_read(record.metric.owner_id) {
        warn!(
            "Latest metric denied: device {} user {}",
            device_id, identity.user_id
        );
        return Err(AppError::Forbidden("Not allowed to read this device".into()));
    }

    Ok(Json(record))
}

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to read metrics".to_string(),
                )
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
