//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::{Api, ListParams};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::ServiceMeshControlPlane;

use super::dto::{
    ControlPlaneDetailResponse, ControlPlaneListResponse, ControlPlaneSummary, ErrorResponse,
    HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Metrics endpoint in the Prometheus text format
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, ApiError> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|e| {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("metrics_failed", &e.to_string())),
            )
        })?;
    Ok(buffer)
}

/// List the control planes in the watched scope
#[instrument(skip(state))]
pub async fn list_control_planes(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ControlPlaneListResponse>, ApiError> {
    match state.control_planes().list(&ListParams::default()).await {
        Ok(list) => {
            let items: Vec<ControlPlaneSummary> =
                list.items.iter().map(ControlPlaneSummary::from).collect();
            let total = items.len();
            Ok(Json(ControlPlaneListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list control planes: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Status of one control plane, down to its components
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_control_plane(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ControlPlaneDetailResponse>, ApiError> {
    let api: Api<ServiceMeshControlPlane> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(smcp) => Ok(Json(ControlPlaneDetailResponse::from(&smcp))),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("ServiceMeshControlPlane {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get control plane {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
